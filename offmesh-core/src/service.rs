//! Service identifier: the fixed value both ends of a link agree on.

use std::fmt;

use uuid::Uuid;

/// The OffMesh chat service. Registered by the listener, requested by the connector.
pub const SERVICE_ID: ServiceId = ServiceId::new(
    Uuid::from_u128(0xfa87c0d0_afac_11de_8a39_0800200c9a66),
    "OffMesh",
);

/// 128-bit service identifier plus a human-readable name.
/// Only the UUID takes part in matching; the name is informational.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct ServiceId {
    uuid: Uuid,
    name: &'static str,
}

impl ServiceId {
    pub const fn new(uuid: Uuid, name: &'static str) -> Self {
        Self { uuid, name }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.uuid.as_bytes()
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.uuid)
    }
}
