//! Plain data carried by the wire protocol: addresses, tests, products, nodes and files.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};

/// Longest accepted test identifier.
pub const MAX_TEST_ID_LEN: usize = 128;

/// Characters that may not appear in a test identifier.
pub const FORBIDDEN_ID_CHARS: &[char] = &['<', '>', '&', '"', '\'', '/', '\\', ':', '*', '?', '|'];

/// A host:port pair naming one end of a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    /// Host name or IP literal.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Address {
    /// Creates an address from its parts.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Returns the `host:port` string used to open connections.
    pub fn to_socket_addr_string(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// True when the address can be dialled.
    pub fn is_routable(&self) -> bool {
        !self.host.trim().is_empty() && self.port != 0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Address {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| TransportError::InvalidAddress(s.to_string()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| TransportError::InvalidAddress(s.to_string()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(TransportError::InvalidAddress(s.to_string()));
        }
        Ok(Self::new(host, port))
    }
}

/// Lifecycle status of a test as reported by the scheduling service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestStatus {
    /// Status not known yet.
    #[default]
    Unknown,
    /// Accepted, waiting for resources.
    Pending,
    /// Running on a test node.
    Started,
    /// Stopped before completion.
    Stopped,
    /// Completed.
    Finished,
    /// Failed; the test's reason field says why.
    Failed,
}

impl TestStatus {
    /// Wire spelling of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::Unknown => "UNKNOWN",
            TestStatus::Pending => "PENDING",
            TestStatus::Started => "STARTED",
            TestStatus::Stopped => "STOPPED",
            TestStatus::Finished => "FINISHED",
            TestStatus::Failed => "FAILED",
        }
    }

    /// Parses a status, case-insensitively. Unrecognized values map to `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => TestStatus::Pending,
            "STARTED" => TestStatus::Started,
            "STOPPED" => TestStatus::Stopped,
            "FINISHED" => TestStatus::Finished,
            "FAILED" => TestStatus::Failed,
            _ => TestStatus::Unknown,
        }
    }

    /// True for statuses after which the test never changes again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TestStatus::Stopped | TestStatus::Finished | TestStatus::Failed
        )
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A product (device, license, machine) a test requires or has reserved.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Product {
    /// Product identifier.
    pub id: String,
    /// Product type, e.g. `board` or `license`.
    pub product_type: String,
    /// Environment the product belongs to.
    pub environment: Option<String>,
    /// Host the product is attached to.
    pub hostname: Option<String>,
    /// Test currently holding the product.
    pub reserved_by: Option<String>,
}

impl Product {
    /// Creates a product with only an id and a type.
    pub fn new(id: impl Into<String>, product_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            product_type: product_type.into(),
            ..Default::default()
        }
    }
}

/// Description of a test submitted to the farm.
///
/// The identifier is fixed at construction and checked against
/// [`FORBIDDEN_ID_CHARS`]; everything else is a snapshot that the scheduling
/// service replaces on every update.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Test {
    id: String,
    /// Current lifecycle status.
    pub status: TestStatus,
    /// Execution timeout in seconds.
    pub timeout_secs: u64,
    /// Directory holding the test's files on this host.
    pub workspace: PathBuf,
    /// Environment the test must run in.
    pub environment: Option<String>,
    /// Failure reason reported by the service.
    pub reason: Option<String>,
    /// Name of the script to execute.
    pub script: Option<String>,
    /// Files the test node fetches from the workspace.
    pub packages: Vec<String>,
    /// Products the test needs.
    pub required_products: Vec<Product>,
    /// Products reserved for the test by the scheduler.
    pub reserved_products: Vec<Product>,
}

impl Test {
    /// Creates a pending test after validating its identifier.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        validate_test_id(&id)?;
        Ok(Self {
            id,
            status: TestStatus::Pending,
            ..Default::default()
        })
    }

    pub(crate) fn with_unchecked_id(id: String) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub(crate) fn set_id_unchecked(&mut self, id: String) {
        self.id = id;
    }

    /// The test identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Checks that required products agree with the test environment.
    pub fn check_environment(&self) -> Result<()> {
        for product in &self.required_products {
            let Some(wanted) = product.environment.as_deref() else {
                continue;
            };
            match self.environment.as_deref() {
                Some(env) if env == wanted => {}
                Some(env) => {
                    return Err(TransportError::InvalidTest {
                        test_id: self.id.clone(),
                        reason: format!(
                            "product {} belongs to environment {wanted}, test targets {env}",
                            product.id
                        ),
                    })
                }
                None => {
                    return Err(TransportError::InvalidTest {
                        test_id: self.id.clone(),
                        reason: format!(
                            "product {} requires environment {wanted} but the test has none",
                            product.id
                        ),
                    })
                }
            }
        }
        Ok(())
    }
}

/// Validates a test identifier.
pub fn validate_test_id(id: &str) -> Result<()> {
    let reason = if id.is_empty() {
        Some("identifier is empty".to_string())
    } else if id.chars().count() > MAX_TEST_ID_LEN {
        Some(format!("identifier exceeds {MAX_TEST_ID_LEN} characters"))
    } else if let Some(c) = id
        .chars()
        .find(|c| FORBIDDEN_ID_CHARS.contains(c) || c.is_whitespace() || c.is_control())
    {
        Some(format!("identifier contains forbidden character {c:?}"))
    } else {
        None
    };
    match reason {
        Some(reason) => Err(TransportError::InvalidTest {
            test_id: id.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// Category of a remote peer in a registry operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RemoteCategory {
    /// A test-issuing client.
    Client,
    /// A test node communicator.
    TestNode,
    /// Anything else.
    #[default]
    Unknown,
}

impl RemoteCategory {
    /// Wire spelling of the category.
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteCategory::Client => "CLIENT",
            RemoteCategory::TestNode => "TEST_NODE",
            RemoteCategory::Unknown => "UNKNOWN",
        }
    }

    /// Parses a category, case-insensitively. Unrecognized values map to `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "CLIENT" => RemoteCategory::Client,
            "TEST_NODE" => RemoteCategory::TestNode,
            _ => RemoteCategory::Unknown,
        }
    }
}

/// A test node advertised in registry operations.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeDescriptor {
    /// Host the node listens on.
    pub hostname: String,
    /// Port the node listens on.
    pub port: u16,
    /// Free-form description.
    pub description: Option<String>,
    /// Products attached to the node.
    pub products: Vec<Product>,
}

impl NodeDescriptor {
    /// Address of the node.
    pub fn address(&self) -> Address {
        Address::new(self.hostname.clone(), self.port)
    }
}

/// A file exchanged through GET/PUT/ABORT operations.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileDescriptor {
    /// File name.
    pub name: String,
    /// Directory relative to the test workspace.
    pub path: Option<String>,
    /// Declared size in bytes; `None` when unknown.
    pub size: Option<u64>,
}

impl FileDescriptor {
    /// Creates a descriptor of unknown size at the workspace root.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: None,
            size: None,
        }
    }

    /// Directory for this file under `workspace`.
    ///
    /// Fails when the name or the path would leave the workspace.
    pub fn directory(&self, workspace: &Path) -> Result<PathBuf> {
        validate_file_name(&self.name)?;
        let Some(path) = self.path.as_deref().map(|p| p.trim_start_matches('/')) else {
            return Ok(workspace.to_path_buf());
        };
        let relative = Path::new(path);
        if let Some(bad) = relative
            .components()
            .find(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(TransportError::invalid(format!(
                "file path {path:?} has forbidden component {:?}",
                bad.as_os_str()
            )));
        }
        Ok(workspace.join(relative))
    }
}

/// Checks that `name` is a plain file name with no directory part.
pub fn validate_file_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0'])
        || Path::new(name).components().count() != 1;
    if bad {
        return Err(TransportError::invalid(format!("unusable file name {name:?}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_parse_and_display() {
        let addr: Address = "svc:9000".parse().unwrap();
        assert_eq!(addr, Address::new("svc", 9000));
        assert_eq!(addr.to_string(), "svc:9000");
        assert!("svc".parse::<Address>().is_err());
        assert!(":9000".parse::<Address>().is_err());
        assert!("svc:notaport".parse::<Address>().is_err());
        assert_eq!("[::1]:80".parse::<Address>().unwrap().host, "::1");
    }

    #[test]
    fn test_id_validation() {
        assert!(Test::new("T1").is_ok());
        assert!(Test::new("nightly-regression_42.a").is_ok());
        assert!(Test::new("").is_err());
        assert!(Test::new("a b").is_err());
        assert!(Test::new("a<b").is_err());
        assert!(Test::new("dir/test").is_err());
        assert!(Test::new("x".repeat(MAX_TEST_ID_LEN + 1)).is_err());
    }

    #[test]
    fn test_status_parse_is_case_insensitive() {
        assert_eq!(TestStatus::parse("started"), TestStatus::Started);
        assert_eq!(TestStatus::parse(" Finished "), TestStatus::Finished);
        assert_eq!(TestStatus::parse("bogus"), TestStatus::Unknown);
        assert!(TestStatus::Failed.is_terminal());
        assert!(!TestStatus::Started.is_terminal());
    }

    #[test]
    fn test_environment_consistency() {
        let mut test = Test::new("T1").unwrap();
        test.required_products.push(Product {
            environment: Some("lab-a".into()),
            ..Product::new("board-1", "board")
        });
        assert!(test.check_environment().is_err());

        test.environment = Some("lab-b".into());
        assert!(test.check_environment().is_err());

        test.environment = Some("lab-a".into());
        assert!(test.check_environment().is_ok());

        test.required_products.push(Product::new("license-1", "license"));
        assert!(test.check_environment().is_ok());
    }

    #[test]
    fn test_file_directory() {
        let ws = std::path::Path::new("/ws");
        let mut fd = FileDescriptor::new("a.tar");
        assert_eq!(fd.directory(ws).unwrap(), PathBuf::from("/ws"));
        fd.path = Some("/results".into());
        assert_eq!(fd.directory(ws).unwrap(), PathBuf::from("/ws/results"));
        fd.path = Some("out/./logs".into());
        assert_eq!(fd.directory(ws).unwrap(), PathBuf::from("/ws/out/logs"));
    }

    #[test]
    fn test_file_directory_stays_in_workspace() {
        let ws = std::path::Path::new("/ws");
        for name in ["", ".", "..", "/etc/passwd", "../secret", "sub/file", "a\\b"] {
            assert!(FileDescriptor::new(name).directory(ws).is_err(), "{name:?}");
        }
        for path in ["..", "out/../../etc", "//..", "a/.."] {
            let fd = FileDescriptor {
                path: Some(path.into()),
                ..FileDescriptor::new("a.tar")
            };
            assert!(fd.directory(ws).is_err(), "{path:?}");
        }
        assert!(validate_file_name("result.log").is_ok());
        assert!(validate_file_name("..hidden").is_ok());
    }

    #[test]
    fn test_deserialize_test_description() {
        let json = r#"{
            "id": "T1",
            "timeout_secs": 600,
            "workspace": "/tmp/ws",
            "packages": ["suite.tar.gz"],
            "required_products": [{"id": "board-1", "product_type": "board"}]
        }"#;
        let test: Test = serde_json::from_str(json).unwrap();
        assert_eq!(test.id(), "T1");
        assert_eq!(test.status, TestStatus::Unknown);
        assert_eq!(test.packages, vec!["suite.tar.gz"]);
        assert_eq!(test.required_products[0].product_type, "board");
    }
}
