use std::fmt;

use uuid::Uuid;

/// Protocol version negotiated when a session is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion(pub u16);

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Opaque identifier for an open session.
///
/// Immutable after creation; the protocol version rides along so callers
/// don't need a registry lookup to know how to talk to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    id: Uuid,
    protocol: ProtocolVersion,
}

impl SessionHandle {
    pub fn new(protocol: ProtocolVersion) -> SessionHandle {
        SessionHandle {
            id: Uuid::new_v4(),
            protocol,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn protocol(&self) -> ProtocolVersion {
        self.protocol
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Kind of work an operation represents.
///
/// Statement execution is the only kind today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    ExecuteStatement,
}

/// Opaque identifier for a single operation within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationHandle {
    id: Uuid,
    op_type: OperationType,
}

impl OperationHandle {
    pub fn new(op_type: OperationType) -> OperationHandle {
        OperationHandle {
            id: Uuid::new_v4(),
            op_type,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn op_type(&self) -> OperationType {
        self.op_type
    }
}

impl fmt::Display for OperationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}
