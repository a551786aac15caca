//! Shared helpers for driver unit tests.

use crate::transport::MockChannel;

/// Writes captured by the mock, with the `*OPC?` handshake queries
/// filtered out so assertions can focus on the command sequence.
pub fn wire_writes(mock: &MockChannel) -> Vec<String> {
    mock.take_writes()
        .into_iter()
        .filter(|line| line != "*OPC?")
        .collect()
}
