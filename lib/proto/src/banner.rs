use serde_derive::Deserialize;
use std::fmt::Write;

/// Identity strings advertised to the host in the CNXN banner.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceInfo {
    pub device_id: String,
    pub product_name: Option<String>,
    pub product_model: Option<String>,
    pub product_device: Option<String>,
    pub features: String,
}

impl Default for DeviceInfo {
    fn default() -> DeviceInfo {
        DeviceInfo {
            device_id: "rust-adbd".to_string(),
            product_name: None,
            product_model: None,
            product_device: None,
            features: "cmd,shell_v1".to_string(),
        }
    }
}

impl DeviceInfo {
    /// Builds the CNXN payload: `device:<id>:` followed by semicolon
    /// terminated `key=value` fragments and the feature list.
    pub fn banner(&self) -> String {
        let mut banner = format!("device:{}:", self.device_id);

        if let Some(name) = &self.product_name {
            write!(banner, "ro.product.name={};", name).expect("banner write");
        }
        if let Some(model) = &self.product_model {
            write!(banner, "ro.product.model={};", model).expect("banner write");
        }
        if let Some(device) = &self.product_device {
            write!(banner, "ro.product.device={};", device).expect("banner write");
        }

        write!(banner, "features={}", self.features).expect("banner write");
        banner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_banner_minimal() {
        let info = DeviceInfo {
            device_id: "unit".to_string(),
            product_name: None,
            product_model: None,
            product_device: None,
            features: "cmd".to_string(),
        };

        assert_eq!(info.banner(), "device:unit:features=cmd");
    }

    #[test]
    fn test_banner_all_fragments() {
        let info = DeviceInfo {
            device_id: "serial".to_string(),
            product_name: Some("alpha".to_string()),
            product_model: Some("beta".to_string()),
            product_device: Some("gamma".to_string()),
            features: "cmd,shell_v1".to_string(),
        };

        assert_eq!(
            info.banner(),
            "device:serial:ro.product.name=alpha;ro.product.model=beta;\
             ro.product.device=gamma;features=cmd,shell_v1"
        );
    }
}
