//! Packet identifier allocation.
//!
//! - [MQTT-2.3.1-1] SUBSCRIBE, UNSUBSCRIBE and PUBLISH (QoS > 0) carry a non-zero identifier.
//! - [MQTT-2.3.1-2] A new packet uses an identifier that is not currently in use.

/// Wrapping 16-bit counter that never yields 0.
#[derive(Debug, Clone)]
pub struct PacketIdAllocator {
    next_id: u16,
}

impl Default for PacketIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketIdAllocator {
    pub fn new() -> Self {
        Self { next_id: 1 }
    }

    /// Next identifier in sequence. After 65535 comes 1.
    pub fn next_id(&mut self) -> u16 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        if self.next_id == 0 {
            self.next_id = 1;
        }
        id
    }

    /// Next identifier for which `in_use` is false.
    ///
    /// Returns `None` if all 65535 identifiers are taken.
    pub fn allocate(&mut self, in_use: impl Fn(u16) -> bool) -> Option<u16> {
        (0..u16::MAX).map(|_| self.next_id()).find(|&id| !in_use(id))
    }

    /// Restart the sequence at 1 (clean session).
    pub fn reset(&mut self) {
        self.next_id = 1;
    }
}
