//! Request loader
//!
//! Reads a [`ProvisionRequest`] from YAML or JSON and rejects requests that
//! cannot be compiled at all (blank names, blank scope).

use crate::error::{CoreError, Result};
use crate::model::ProvisionRequest;
use std::path::Path;
use tracing::{debug, instrument};

/// Load a request file. `.json` files are parsed as JSON, anything else as YAML.
#[instrument(fields(path = %path.display()))]
pub fn load_request(path: &Path) -> Result<ProvisionRequest> {
    let content = std::fs::read_to_string(path)?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    let request = if is_json {
        serde_json::from_str(&content)?
    } else {
        parse_request(&content)?
    };
    check_request(&request)?;
    debug!(items = request.items().len(), "Loaded request");
    Ok(request)
}

/// Parse a YAML request (JSON is valid YAML too)
pub fn parse_request(content: &str) -> Result<ProvisionRequest> {
    let request: ProvisionRequest = serde_yaml::from_str(content)?;
    check_request(&request)?;
    Ok(request)
}

fn check_request(request: &ProvisionRequest) -> Result<()> {
    if request.scope.account.trim().is_empty() || request.scope.region.trim().is_empty() {
        return Err(CoreError::InvalidRequest(
            "scope needs both account and region".to_string(),
        ));
    }
    for item in request.items() {
        if item.name().trim().is_empty() {
            return Err(CoreError::InvalidRequest(format!(
                "{} with an empty name",
                item.kind
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ImageSource;
    use std::io::Write;
    use tempfile::Builder;

    const REQUEST: &str = r#"
scope:
  account: "1234"
  region: us-south
network:
  name: vpc-a
subnets:
  - name: subnet-a
    public_gateway: pgw-a
public_gateways:
  - name: pgw-a
instances:
  - name: web-1
    image:
      source: classic_instance
      account: "9876"
      instance_id: "cci-42"
    interfaces:
      - name: eth0
        subnet: subnet-a
"#;

    #[test]
    fn test_parse_yaml_request() {
        let request = parse_request(REQUEST).unwrap();
        assert_eq!(request.scope.region, "us-south");
        assert_eq!(request.subnets.len(), 1);
        assert_eq!(
            request.instances[0].image,
            ImageSource::ClassicInstance {
                account: "9876".to_string(),
                instance_id: "cci-42".to_string(),
                windows_backup: false,
            }
        );
    }

    #[test]
    fn test_load_json_request() {
        let mut file = Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{"scope": {{"account": "1234", "region": "eu-de"}},
                "ssh_keys": [{{"name": "ops"}}]}}"#
        )
        .unwrap();

        let request = load_request(file.path()).unwrap();
        assert_eq!(request.ssh_keys[0].base.name, "ops");
    }

    #[test]
    fn test_blank_name_is_rejected() {
        let content = r#"
scope: { account: "1234", region: us-south }
volumes:
  - name: "  "
"#;
        let err = parse_request(content).unwrap_err();
        assert!(matches!(err, CoreError::InvalidRequest(_)));
    }

    #[test]
    fn test_blank_scope_is_rejected() {
        let content = r#"scope: { account: "", region: us-south }"#;
        assert!(parse_request(content).is_err());
    }
}
