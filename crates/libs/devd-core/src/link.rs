use crate::http::{HttpMethod, HttpRequest};
use std::time::Duration;

/// Addressing for the device's cloud service.
///
/// URIs may carry `$DEV_KEY` and `$DSN` placeholders which are expanded
/// when the link is built.
#[derive(Debug, Clone, PartialEq)]
pub struct CloudLink {
    pub scheme: &'static str,
    pub host: String,
    pub dsn: String,
    /// Cloud-assigned device key, empty until the device info GET succeeds.
    pub key: String,
    pub timeout: Duration,
}

impl Default for CloudLink {
    fn default() -> Self {
        Self {
            scheme: "https",
            host: String::new(),
            dsn: String::new(),
            key: String::new(),
            timeout: Duration::from_secs(60),
        }
    }
}

impl CloudLink {
    pub fn expand(&self, uri: &str) -> String {
        uri.replace("$DEV_KEY", &self.key).replace("$DSN", &self.dsn)
    }

    pub fn url(&self, uri: &str) -> String {
        format!("{}://{}/{}", self.scheme, self.host, self.expand(uri.trim_start_matches('/')))
    }

    /// `devices/<key>/<rest>` on the cloud host.
    pub fn device_url(&self, rest: &str) -> String {
        self.url(&format!("devices/$DEV_KEY/{}", rest.trim_start_matches('/')))
    }

    /// `dev/v1/dsns/<dsn>/<rest>` on the cloud host.
    pub fn dsn_url(&self, rest: &str) -> String {
        self.url(&format!("dev/v1/dsns/$DSN/{}", rest.trim_start_matches('/')))
    }

    /// `dev/v1/dsns/<node dsn>/<rest>`: resources of a node behind the gateway.
    pub fn node_url(&self, dsn: &str, rest: &str) -> String {
        self.url(&format!("dev/v1/dsns/{dsn}/{}", rest.trim_start_matches('/')))
    }

    pub fn request(&self, method: HttpMethod, url: impl Into<String>) -> HttpRequest {
        HttpRequest::new(method, url).timeout(self.timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link() -> CloudLink {
        CloudLink {
            host: "ads.example.com".to_string(),
            dsn: "AC000W1".to_string(),
            key: "4242".to_string(),
            ..CloudLink::default()
        }
    }

    #[test]
    fn placeholders_expand_in_urls() {
        let link = link();
        assert_eq!(
            link.device_url("properties/Blue_LED/datapoints.json"),
            "https://ads.example.com/devices/4242/properties/Blue_LED/datapoints.json"
        );
        assert_eq!(
            link.dsn_url("batch_datapoints.json"),
            "https://ads.example.com/dev/v1/dsns/AC000W1/batch_datapoints.json"
        );
        assert_eq!(link.url("/dsns/$DSN.json"), "https://ads.example.com/dsns/AC000W1.json");
    }

    #[test]
    fn node_urls_name_the_node_not_the_gateway() {
        assert_eq!(
            link().node_url("VR00ZN000000123", "properties/sub1:tmpl:onoff.json"),
            "https://ads.example.com/dev/v1/dsns/VR00ZN000000123/properties/sub1:tmpl:onoff.json"
        );
    }
}
