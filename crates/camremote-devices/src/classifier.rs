/*!
 * Device classification against vendor and model identity rules.
 */
use serde::{Deserialize, Serialize};

use camremote_core::config::DiscoveryConfig;

/// Outcome of classifying one device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    /// The vendor ID matches the target vendor
    pub target_vendor: bool,
    /// The device is a known target model
    pub target_model: bool,
}

/// Identity rules for the target camera
#[derive(Debug, Clone)]
pub struct DeviceClassifier {
    vendor_id: u16,
    model_names: Vec<String>,
    product_ids: Vec<u16>,
}

impl DeviceClassifier {
    /// Create a classifier from explicit rules
    pub fn new<I, S>(vendor_id: u16, model_names: I, product_ids: Vec<u16>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            vendor_id,
            // stored lowercased; matching is case-insensitive
            model_names: model_names
                .into_iter()
                .map(|name| name.as_ref().to_lowercase())
                .filter(|name| !name.is_empty())
                .collect(),
            product_ids,
        }
    }

    /// Create a classifier from the discovery configuration
    pub fn from_config(config: &DiscoveryConfig) -> Self {
        Self::new(
            config.target_vendor_id,
            &config.model_names,
            config.product_ids.clone(),
        )
    }

    /// Target vendor ID
    pub fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    /// Exact vendor ID match
    pub fn is_target_vendor(&self, vendor_id: u16) -> bool {
        vendor_id == self.vendor_id
    }

    /// Whether the device is a known target model
    ///
    /// A non-empty product string decides on its own; the product ID table is
    /// consulted only when no string could be read.
    pub fn is_target_model(&self, vendor_id: u16, product_id: u16, product: Option<&str>) -> bool {
        if !self.is_target_vendor(vendor_id) {
            return false;
        }
        match product.map(str::trim).filter(|p| !p.is_empty()) {
            Some(product) => {
                let product = product.to_lowercase();
                self.model_names.iter().any(|name| product.contains(name.as_str()))
            }
            None => self.product_ids.contains(&product_id),
        }
    }

    /// Classify a device
    pub fn classify(&self, vendor_id: u16, product_id: u16, product: Option<&str>) -> Classification {
        Classification {
            target_vendor: self.is_target_vendor(vendor_id),
            target_model: self.is_target_model(vendor_id, product_id, product),
        }
    }

    /// Diagnostic-only policy: any target-vendor device is presumed to be a camera
    ///
    /// Used to word the USB report; never used to pick a device to connect to.
    pub fn presumed_camera(&self, vendor_id: u16) -> bool {
        self.is_target_vendor(vendor_id)
    }
}

impl Default for DeviceClassifier {
    fn default() -> Self {
        Self::from_config(&DiscoveryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camremote_core::config::SONY_VENDOR_ID;

    const OTHER_VENDOR: u16 = 0x046d;
    const KNOWN_PID: u16 = 0x0d9f;

    #[test]
    fn test_other_vendor_is_not_target() {
        let classifier = DeviceClassifier::default();
        let c = classifier.classify(OTHER_VENDOR, KNOWN_PID, Some("ILCE-7M4"));
        assert!(!c.target_vendor);
        assert!(!c.target_model);
    }

    #[test]
    fn test_product_string_match_is_case_insensitive() {
        let classifier = DeviceClassifier::default();
        assert!(classifier.is_target_model(SONY_VENDOR_ID, 0x0001, Some("Sony ilce-7m4")));
        assert!(classifier.is_target_model(SONY_VENDOR_ID, 0x0001, Some("ALPHA 7 IV")));
    }

    #[test]
    fn test_nonmatching_string_ignores_product_id() {
        let classifier = DeviceClassifier::default();
        let c = classifier.classify(SONY_VENDOR_ID, KNOWN_PID, Some("DSC-RX100"));
        assert!(c.target_vendor);
        assert!(!c.target_model);
    }

    #[test]
    fn test_product_id_fallback_without_string() {
        let classifier = DeviceClassifier::default();
        assert!(classifier.is_target_model(SONY_VENDOR_ID, KNOWN_PID, None));
        assert!(classifier.is_target_model(SONY_VENDOR_ID, KNOWN_PID, Some("  ")));
        assert!(!classifier.is_target_model(SONY_VENDOR_ID, 0x0001, None));
    }

    #[test]
    fn test_presumed_camera_is_vendor_only() {
        let classifier = DeviceClassifier::new(0x1234, ["X-1"], vec![]);
        assert!(classifier.presumed_camera(0x1234));
        assert!(!classifier.presumed_camera(SONY_VENDOR_ID));
        assert_eq!(classifier.vendor_id(), 0x1234);
    }
}
