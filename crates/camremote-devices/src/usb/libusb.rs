/*!
 * libusb-1.0, loaded at runtime.
 *
 * The library is optional: it is looked up in a list of search roots and, when
 * none of the candidates loads, USB diagnostics are reported as unavailable.
 * Every libusb resource is held by a guard so that it is freed exactly once,
 * in reverse order of acquisition, on every exit path.
 */
use std::ffi::{c_char, c_int, c_void, CStr};
use std::fmt;
use std::path::{Path, PathBuf};
use std::ptr;

use libloading::{Library, Symbol};
use tracing::{debug, info, trace, warn};

use camremote_core::config::DiscoveryConfig;

use super::{RawBus, RawBusDevice, UsbStrings};
use crate::device::{DeviceError, Result};

type InitFn = unsafe extern "C" fn(*mut *mut c_void) -> c_int;
type ExitFn = unsafe extern "C" fn(*mut c_void);
type GetDeviceListFn = unsafe extern "C" fn(*mut c_void, *mut *const *mut c_void) -> isize;
type FreeDeviceListFn = unsafe extern "C" fn(*const *mut c_void, c_int);
type GetDeviceDescriptorFn = unsafe extern "C" fn(*mut c_void, *mut DeviceDescriptor) -> c_int;
type GetBusNumberFn = unsafe extern "C" fn(*mut c_void) -> u8;
type GetDeviceAddressFn = unsafe extern "C" fn(*mut c_void) -> u8;
type OpenFn = unsafe extern "C" fn(*mut c_void, *mut *mut c_void) -> c_int;
type CloseFn = unsafe extern "C" fn(*mut c_void);
type GetStringDescriptorAsciiFn = unsafe extern "C" fn(*mut c_void, u8, *mut u8, c_int) -> c_int;
type ErrorNameFn = unsafe extern "C" fn(c_int) -> *const c_char;

/// `struct libusb_device_descriptor`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct DeviceDescriptor {
    length: u8,
    descriptor_type: u8,
    bcd_usb: u16,
    device_class: u8,
    device_sub_class: u8,
    device_protocol: u8,
    max_packet_size0: u8,
    id_vendor: u16,
    id_product: u16,
    bcd_device: u16,
    i_manufacturer: u8,
    i_product: u8,
    i_serial_number: u8,
    num_configurations: u8,
}

const STRING_BUFFER_LEN: usize = 256;

/// Probes the configured search roots for the bus library
#[derive(Debug, Clone)]
pub struct BusLibraryLoader {
    roots: Vec<PathBuf>,
    names: Vec<String>,
    system_search: bool,
}

impl BusLibraryLoader {
    /// Create a loader
    pub fn new<P: AsRef<Path>>(roots: &[P], names: &[String], system_search: bool) -> Self {
        Self {
            roots: roots.iter().map(|r| r.as_ref().to_path_buf()).collect(),
            names: names.to_vec(),
            system_search,
        }
    }

    /// Create a loader from the discovery configuration
    pub fn from_config(config: &DiscoveryConfig) -> Self {
        Self::new(
            &config.bus_library_search_roots,
            &config.bus_library_names,
            config.bus_library_system_search,
        )
    }

    /// Candidate paths, in probing order
    pub fn candidates(&self) -> Vec<PathBuf> {
        let mut candidates: Vec<PathBuf> = self
            .roots
            .iter()
            .flat_map(|root| self.names.iter().map(move |name| root.join(name)))
            .collect();
        if self.system_search {
            candidates.extend(self.names.iter().map(PathBuf::from));
        }
        candidates
    }

    /// Load the first candidate that resolves every required symbol
    pub fn load(&self) -> Option<LibUsb> {
        for candidate in self.candidates() {
            // Bare names go to the platform loader; rooted ones must exist
            if candidate.components().count() > 1 && !candidate.exists() {
                trace!("Skipping missing {}", candidate.display());
                continue;
            }
            match LibUsb::open(&candidate) {
                Ok(lib) => {
                    info!("Loaded USB library from {}", candidate.display());
                    return Some(lib);
                }
                Err(e) => debug!("Could not load {}: {}", candidate.display(), e),
            }
        }
        warn!("No USB library found; USB diagnostics unavailable");
        None
    }
}

/// libusb function table
pub struct LibUsb {
    path: PathBuf,
    init: InitFn,
    exit: ExitFn,
    get_device_list: GetDeviceListFn,
    free_device_list: FreeDeviceListFn,
    get_device_descriptor: GetDeviceDescriptorFn,
    get_bus_number: GetBusNumberFn,
    get_device_address: GetDeviceAddressFn,
    open: OpenFn,
    close: CloseFn,
    get_string_descriptor_ascii: GetStringDescriptorAsciiFn,
    error_name: ErrorNameFn,
    // keeps the function pointers above valid; dropped last
    _library: Library,
}

fn symbol<T: Copy>(library: &Library, name: &str) -> Result<T> {
    // SAFETY: every caller pairs the symbol name with its libusb-1.0 signature
    let sym: Symbol<T> = unsafe { library.get(name.as_bytes()) }
        .map_err(|e| DeviceError::DynamicLoad(format!("missing symbol {}: {}", name, e)))?;
    Ok(*sym)
}

impl LibUsb {
    /// Load libusb from `path` and resolve the symbols used for scanning
    pub fn open(path: &Path) -> Result<Self> {
        // SAFETY: loading runs the library's initializers; libusb has no unsound ones
        let library = unsafe { Library::new(path) }
            .map_err(|e| DeviceError::DynamicLoad(format!("{}: {}", path.display(), e)))?;

        Ok(Self {
            path: path.to_path_buf(),
            init: symbol(&library, "libusb_init")?,
            exit: symbol(&library, "libusb_exit")?,
            get_device_list: symbol(&library, "libusb_get_device_list")?,
            free_device_list: symbol(&library, "libusb_free_device_list")?,
            get_device_descriptor: symbol(&library, "libusb_get_device_descriptor")?,
            get_bus_number: symbol(&library, "libusb_get_bus_number")?,
            get_device_address: symbol(&library, "libusb_get_device_address")?,
            open: symbol(&library, "libusb_open")?,
            close: symbol(&library, "libusb_close")?,
            get_string_descriptor_ascii: symbol(&library, "libusb_get_string_descriptor_ascii")?,
            error_name: symbol(&library, "libusb_error_name")?,
            _library: library,
        })
    }

    /// Where the library was loaded from
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn error_name(&self, code: c_int) -> String {
        // SAFETY: libusb_error_name returns a static string or null
        let name = unsafe { (self.error_name)(code) };
        if name.is_null() {
            return format!("libusb error {}", code);
        }
        unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned()
    }

    fn read_string(&self, device: &OpenDevice<'_>, index: u8) -> Option<String> {
        if index == 0 {
            return None;
        }
        let mut buffer = [0u8; STRING_BUFFER_LEN];
        // SAFETY: the handle is open and the buffer length is passed along
        let len = unsafe {
            (self.get_string_descriptor_ascii)(
                device.handle,
                index,
                buffer.as_mut_ptr(),
                STRING_BUFFER_LEN as c_int,
            )
        };
        if len <= 0 {
            trace!("String descriptor {} unreadable: {}", index, self.error_name(len));
            return None;
        }
        let text = String::from_utf8_lossy(&buffer[..len as usize]).trim().to_string();
        (!text.is_empty()).then_some(text)
    }

    fn read_strings(
        &self,
        device: *mut c_void,
        descriptor: &DeviceDescriptor,
    ) -> std::result::Result<UsbStrings, String> {
        let opened = OpenDevice::open(self, device)?;
        Ok(UsbStrings {
            manufacturer: self.read_string(&opened, descriptor.i_manufacturer),
            product: self.read_string(&opened, descriptor.i_product),
            serial: self.read_string(&opened, descriptor.i_serial_number),
        })
    }
}

impl fmt::Debug for LibUsb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LibUsb").field("path", &self.path).finish()
    }
}

impl RawBus for LibUsb {
    fn name(&self) -> &str {
        "libusb"
    }

    fn scan(&self) -> Result<Vec<RawBusDevice>> {
        let context = Context::new(self)?;
        let list = DeviceList::new(self, &context)?;

        let mut devices = Vec::with_capacity(list.len);
        for &device in list.as_slice() {
            let mut descriptor = DeviceDescriptor::default();
            // SAFETY: `device` comes from a live device list
            let rc = unsafe { (self.get_device_descriptor)(device, &mut descriptor) };
            if rc < 0 {
                warn!("Skipping device without descriptor: {}", self.error_name(rc));
                continue;
            }
            // SAFETY: as above
            let (bus, address) = unsafe {
                (
                    (self.get_bus_number)(device),
                    (self.get_device_address)(device),
                )
            };
            devices.push(RawBusDevice {
                bus,
                address,
                vendor_id: descriptor.id_vendor,
                product_id: descriptor.id_product,
                strings: self.read_strings(device, &descriptor),
            });
        }
        Ok(devices)
    }
}

/// `libusb_context`, exited on drop
struct Context<'a> {
    lib: &'a LibUsb,
    ptr: *mut c_void,
}

impl<'a> Context<'a> {
    fn new(lib: &'a LibUsb) -> Result<Self> {
        let mut ptr = ptr::null_mut();
        // SAFETY: libusb_init writes a context pointer on success
        let rc = unsafe { (lib.init)(&mut ptr) };
        if rc < 0 {
            return Err(DeviceError::BusScan(format!(
                "libusb_init failed: {}",
                lib.error_name(rc)
            )));
        }
        Ok(Self { lib, ptr })
    }
}

impl Drop for Context<'_> {
    fn drop(&mut self) {
        // SAFETY: created by libusb_init; every list and handle is gone by now
        unsafe { (self.lib.exit)(self.ptr) };
    }
}

/// Device list, freed (and its devices unreferenced) on drop
struct DeviceList<'a> {
    lib: &'a LibUsb,
    ptr: *const *mut c_void,
    len: usize,
}

impl<'a> DeviceList<'a> {
    fn new(lib: &'a LibUsb, context: &Context<'a>) -> Result<Self> {
        let mut ptr = ptr::null();
        // SAFETY: the context is live for the lifetime of the list
        let count = unsafe { (lib.get_device_list)(context.ptr, &mut ptr) };
        if count < 0 {
            return Err(DeviceError::BusScan(format!(
                "libusb_get_device_list failed: {}",
                lib.error_name(count as c_int)
            )));
        }
        Ok(Self {
            lib,
            ptr,
            len: count as usize,
        })
    }

    fn as_slice(&self) -> &[*mut c_void] {
        if self.ptr.is_null() {
            return &[];
        }
        // SAFETY: libusb returned `len` device pointers at `ptr`
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl Drop for DeviceList<'_> {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            // SAFETY: returned by libusb_get_device_list and not yet freed
            unsafe { (self.lib.free_device_list)(self.ptr, 1) };
        }
    }
}

/// Opened device handle, closed on drop
struct OpenDevice<'a> {
    lib: &'a LibUsb,
    handle: *mut c_void,
}

impl<'a> OpenDevice<'a> {
    fn open(lib: &'a LibUsb, device: *mut c_void) -> std::result::Result<Self, String> {
        let mut handle = ptr::null_mut();
        // SAFETY: `device` belongs to a live device list
        let rc = unsafe { (lib.open)(device, &mut handle) };
        if rc < 0 {
            return Err(lib.error_name(rc));
        }
        Ok(Self { lib, handle })
    }
}

impl Drop for OpenDevice<'_> {
    fn drop(&mut self) {
        // SAFETY: opened by libusb_open and not yet closed
        unsafe { (self.lib.close)(self.handle) };
    }
}
