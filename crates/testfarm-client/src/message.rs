//! Message and operation types exchanged with scheduling services and test nodes.
//!
//! A [`Message`] is the envelope common to every wire transfer: who sent it,
//! who should receive it, and one typed [`Operation`]. The codec produces a
//! loosely-typed [`RawEnvelope`] while reading and hands it to
//! [`Message::from_raw`], which is the only place wire fields turn into
//! concrete variants.

use std::fmt;

use crate::codec::LineWriter;
use crate::error::{Result, TransportError};
use crate::types::{Address, FileDescriptor, NodeDescriptor, Product, RemoteCategory, Test};

macro_rules! operation_code {
    ($(#[$meta:meta])* $name:ident, $kind:literal, { $($(#[$vmeta:meta])* $variant:ident => $wire:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            /// Wire spelling of the code.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $wire),+
                }
            }

            /// Parses a code, case-insensitively.
            pub fn parse(code: &str) -> Result<Self> {
                match code.trim().to_ascii_lowercase().as_str() {
                    $($wire => Ok($name::$variant),)+
                    _ => Err(TransportError::UnknownOperation {
                        kind: $kind,
                        code: code.to_string(),
                    }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

operation_code!(
    /// Codes carried by test operations.
    TestOperationCode, "test", {
        /// Start the test.
        Start => "start",
        /// Stop the test.
        Stop => "stop",
        /// New snapshot of the test.
        Update => "update",
        /// Liveness probe for the test.
        Check => "check",
    }
);

operation_code!(
    /// Codes carried by file operations.
    FileOperationCode, "file", {
        /// Request a file from the peer.
        Get => "get",
        /// Deliver a file; raw bytes follow the message.
        Put => "put",
        /// The requested file cannot be produced.
        Abort => "abort",
    }
);

operation_code!(
    /// Codes carried by product operations.
    ProductOperationCode, "product", {
        /// Product added to the farm.
        Add => "add",
        /// Product removed from the farm.
        Remove => "remove",
        /// Product changed.
        Update => "update",
    }
);

operation_code!(
    /// Codes carried by registry operations.
    RegistryOperationCode, "registry", {
        /// Announce a peer.
        Register => "register",
        /// Withdraw a peer.
        Deregister => "deregister",
        /// Refresh a peer's description.
        Update => "update",
    }
);

/// Kind of operation, written as the envelope's `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Test lifecycle operation.
    Test,
    /// Product inventory operation.
    Product,
    /// File transfer operation.
    File,
    /// Peer registration operation.
    Registry,
    /// Free-form text.
    Text,
}

impl OperationKind {
    /// Wire spelling of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Test => "test",
            OperationKind::Product => "product",
            OperationKind::File => "file",
            OperationKind::Registry => "registry",
            OperationKind::Text => "text",
        }
    }

    /// Parses a kind, case-insensitively.
    pub fn parse(kind: &str) -> Option<Self> {
        match kind.trim().to_ascii_lowercase().as_str() {
            "test" => Some(OperationKind::Test),
            "product" => Some(OperationKind::Product),
            "file" => Some(OperationKind::File),
            "registry" => Some(OperationKind::Registry),
            "text" => Some(OperationKind::Text),
            _ => None,
        }
    }
}

/// Test lifecycle operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestOperation {
    /// What to do with the test.
    pub code: TestOperationCode,
    /// Snapshot of the test.
    pub test: Test,
}

/// File transfer operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOperation {
    /// GET, PUT or ABORT.
    pub code: FileOperationCode,
    /// Test the file belongs to.
    pub test_id: String,
    /// The file.
    pub file: FileDescriptor,
}

/// Product inventory operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductOperation {
    /// What happened to the product.
    pub code: ProductOperationCode,
    /// Snapshot of the product.
    pub product: Product,
    /// Test the product is bound to, if any.
    pub test_id: Option<String>,
}

/// Peer registration operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryOperation {
    /// Register, deregister or update.
    pub code: RegistryOperationCode,
    /// Category of the peer described.
    pub category: RemoteCategory,
    /// Node description for test-node peers.
    pub node: Option<NodeDescriptor>,
}

/// Free-form text, usually progress output of a test.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TextMessage {
    /// Test the text relates to.
    pub test_id: Option<String>,
    /// The text; may span several lines.
    pub text: String,
}

/// The typed body of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Test lifecycle operation.
    Test(TestOperation),
    /// Product inventory operation.
    Product(ProductOperation),
    /// File transfer operation.
    File(FileOperation),
    /// Peer registration operation.
    Registry(RegistryOperation),
    /// Free-form text.
    Text(TextMessage),
}

impl Operation {
    /// Kind written to the envelope's `type` field.
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Test(_) => OperationKind::Test,
            Operation::Product(_) => OperationKind::Product,
            Operation::File(_) => OperationKind::File,
            Operation::Registry(_) => OperationKind::Registry,
            Operation::Text(_) => OperationKind::Text,
        }
    }

    /// Test referenced by the operation, if any.
    pub fn test_id(&self) -> Option<&str> {
        match self {
            Operation::Test(op) => Some(op.test.id()),
            Operation::File(op) => Some(op.test_id.as_str()),
            Operation::Product(op) => op.test_id.as_deref(),
            Operation::Text(op) => op.test_id.as_deref(),
            Operation::Registry(_) => None,
        }
    }

    pub(crate) fn write_envelope(&self, w: &mut LineWriter) {
        w.open("envelope");
        match self {
            Operation::Test(op) => {
                w.elem("operation", op.code.as_str());
                write_test(w, &op.test);
            }
            Operation::File(op) => {
                w.elem("operation", op.code.as_str());
                w.elem("testid", &op.test_id);
                w.open("file");
                w.elem("name", &op.file.name);
                w.elem_opt("path", op.file.path.as_deref());
                match op.file.size {
                    Some(size) => w.elem_u64("size", size),
                    None => w.elem("size", "-1"),
                };
                w.close("file");
            }
            Operation::Product(op) => {
                w.elem("operation", op.code.as_str());
                w.elem_opt("testid", op.test_id.as_deref());
                write_product(w, &op.product);
            }
            Operation::Registry(op) => {
                w.elem("operation", op.code.as_str());
                w.elem("category", op.category.as_str());
                if let Some(node) = &op.node {
                    w.open("node");
                    w.elem("hostname", &node.hostname);
                    w.elem_u64("port", u64::from(node.port));
                    w.elem_opt("description", node.description.as_deref());
                    if !node.products.is_empty() {
                        w.open("products");
                        for product in &node.products {
                            write_product(w, product);
                        }
                        w.close("products");
                    }
                    w.close("node");
                }
            }
            Operation::Text(op) => {
                w.elem_opt("testid", op.test_id.as_deref());
                w.text_block("text", &op.text);
            }
        }
        w.close("envelope");
    }
}

fn write_test(w: &mut LineWriter, test: &Test) {
    w.open("test");
    w.elem("id", test.id());
    w.elem("status", test.status.as_str());
    w.elem_u64("timeout", test.timeout_secs);
    w.elem("workspace", &test.workspace.to_string_lossy());
    w.elem_opt("environment", test.environment.as_deref());
    w.elem_opt("reason", test.reason.as_deref());
    w.elem_opt("script", test.script.as_deref());
    if !test.packages.is_empty() {
        w.open("packages");
        for package in &test.packages {
            w.elem("package", package);
        }
        w.close("packages");
    }
    for (tag, products) in [
        ("requiredproducts", &test.required_products),
        ("reservedproducts", &test.reserved_products),
    ] {
        if products.is_empty() {
            continue;
        }
        w.open(tag);
        for product in products {
            write_product(w, product);
        }
        w.close(tag);
    }
    w.close("test");
}

fn write_product(w: &mut LineWriter, product: &Product) {
    w.open("product");
    w.elem("id", &product.id);
    w.elem("type", &product.product_type);
    w.elem_opt("environment", product.environment.as_deref());
    w.elem_opt("hostname", product.hostname.as_deref());
    w.elem_opt("reservedby", product.reserved_by.as_deref());
    w.close("product");
}

/// A complete wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Where replies go.
    pub sender: Address,
    /// Where the message is delivered.
    pub receiver: Address,
    /// The typed body.
    pub operation: Operation,
}

impl Message {
    /// Creates a message.
    pub fn new(sender: Address, receiver: Address, operation: Operation) -> Self {
        Self {
            sender,
            receiver,
            operation,
        }
    }

    /// Builds a test operation message.
    pub fn test(sender: Address, receiver: Address, code: TestOperationCode, test: Test) -> Self {
        Self::new(sender, receiver, Operation::Test(TestOperation { code, test }))
    }

    /// Builds a file operation message.
    pub fn file(
        sender: Address,
        receiver: Address,
        code: FileOperationCode,
        test_id: impl Into<String>,
        file: FileDescriptor,
    ) -> Self {
        Self::new(
            sender,
            receiver,
            Operation::File(FileOperation {
                code,
                test_id: test_id.into(),
                file,
            }),
        )
    }

    /// Kind of the body.
    pub fn kind(&self) -> OperationKind {
        self.operation.kind()
    }

    /// Test referenced by the body, if any.
    pub fn test_id(&self) -> Option<&str> {
        self.operation.test_id()
    }

    /// File operation carried by the message, if that is what it is.
    pub fn as_file(&self) -> Option<&FileOperation> {
        match &self.operation {
            Operation::File(op) => Some(op),
            _ => None,
        }
    }

    /// Serializes the message into its wire text.
    pub fn encode(&self) -> String {
        crate::codec::encode(self)
    }

    /// Builds a concrete message from the fields the decoder collected.
    pub fn from_raw(raw: RawEnvelope) -> Result<Self> {
        let kind_str = raw
            .kind
            .as_deref()
            .ok_or_else(|| TransportError::invalid("missing type"))?;
        let kind = OperationKind::parse(kind_str)
            .ok_or_else(|| TransportError::invalid(format!("unknown type {kind_str:?}")))?;
        let sender = raw.sender.into_address("sender")?;
        let receiver = raw.receiver.into_address("receiver")?;

        let operation = match kind {
            OperationKind::Test => {
                let code = TestOperationCode::parse(required(&raw.code, "operation")?)?;
                let test = raw
                    .test
                    .ok_or_else(|| TransportError::invalid("test operation without test"))?;
                if test.id().is_empty() {
                    return Err(TransportError::invalid("test without id"));
                }
                Operation::Test(TestOperation { code, test })
            }
            OperationKind::File => {
                let code = FileOperationCode::parse(required(&raw.code, "operation")?)?;
                let test_id = raw
                    .test_id
                    .ok_or_else(|| TransportError::invalid("file operation without testid"))?;
                let file = raw
                    .file
                    .ok_or_else(|| TransportError::invalid("file operation without file"))?;
                if file.name.is_empty() {
                    return Err(TransportError::invalid("file without name"));
                }
                Operation::File(FileOperation {
                    code,
                    test_id,
                    file,
                })
            }
            OperationKind::Product => {
                let code = ProductOperationCode::parse(required(&raw.code, "operation")?)?;
                let product = raw
                    .product
                    .ok_or_else(|| TransportError::invalid("product operation without product"))?;
                Operation::Product(ProductOperation {
                    code,
                    product,
                    test_id: raw.test_id,
                })
            }
            OperationKind::Registry => {
                let code = RegistryOperationCode::parse(required(&raw.code, "operation")?)?;
                let category = raw
                    .category
                    .as_deref()
                    .map(RemoteCategory::parse)
                    .unwrap_or_default();
                Operation::Registry(RegistryOperation {
                    code,
                    category,
                    node: raw.node,
                })
            }
            OperationKind::Text => Operation::Text(TextMessage {
                test_id: raw.test_id,
                text: raw.text.unwrap_or_default(),
            }),
        };

        Ok(Self {
            sender,
            receiver,
            operation,
        })
    }
}

fn required<'a>(value: &'a Option<String>, field: &str) -> Result<&'a str> {
    value
        .as_deref()
        .ok_or_else(|| TransportError::invalid(format!("missing {field}")))
}

/// Host and port collected for `sender` or `receiver`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawAddress {
    /// Host, if the element was present.
    pub host: Option<String>,
    /// Port, if the element was present.
    pub port: Option<u16>,
}

impl RawAddress {
    fn into_address(self, which: &str) -> Result<Address> {
        match (self.host, self.port) {
            (Some(host), Some(port)) => Ok(Address::new(host, port)),
            _ => Err(TransportError::invalid(format!("incomplete {which}"))),
        }
    }
}

/// Every field the decoder may collect, before the `type` selects a variant.
#[derive(Debug, Clone, Default)]
pub struct RawEnvelope {
    /// Value of `type`.
    pub kind: Option<String>,
    /// Value of `sender`.
    pub sender: RawAddress,
    /// Value of `receiver`.
    pub receiver: RawAddress,
    /// Value of `operation`.
    pub code: Option<String>,
    /// Value of `testid`.
    pub test_id: Option<String>,
    /// Value of `test`.
    pub test: Option<Test>,
    /// Value of `file`.
    pub file: Option<FileDescriptor>,
    /// Value of `product`.
    pub product: Option<Product>,
    /// Value of `category`.
    pub category: Option<String>,
    /// Value of `node`.
    pub node: Option<NodeDescriptor>,
    /// Value of `text`.
    pub text: Option<String>,
}
