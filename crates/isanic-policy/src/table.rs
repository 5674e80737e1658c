//! Tier-specific copybreak thresholds and the early-16-bit transfer
//! preference, applied after the three-predicate gate passes.

use isanic_platform::CpuFamily;

/// Whether a packet below the copybreak threshold should go through PIO or
/// be handed to DMA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPreference {
    /// Programmed I/O.
    Pio,
    /// Bus-master DMA.
    Dma,
}

/// Default transfer mode for `cpu_family`.
///
/// Every family but the earliest defaults to DMA once the policy gate has
/// passed. `EarlySixteenBit` requires benchmark evidence of more than a 20%
/// throughput gain at the 256-byte copybreak point before it will prefer
/// DMA at all; `benchmark_gain_pct` is `None` when no benchmark has run
/// yet.
#[must_use]
pub fn default_transfer(cpu_family: CpuFamily, benchmark_gain_pct: Option<u8>) -> TransferPreference {
    match cpu_family {
        CpuFamily::EarlySixteenBit => match benchmark_gain_pct {
            Some(gain) if gain > 20 => TransferPreference::Dma,
            _ => TransferPreference::Pio,
        },
        _ => TransferPreference::Dma,
    }
}

/// Copybreak threshold, in bytes, for `cpu_family` under the given
/// coherency conditions.
///
/// `non_coherent` applies to `EarlyThirtyTwoBit` (raises 160 to 192),
/// `flush_slow` applies to `LateThirtyTwoBit` (raises 96 to 128), and
/// `snoop_ok` applies to `Superscalar` (lowers 96 to 64 when bus snooping
/// is confirmed working).
#[must_use]
pub fn copybreak_bytes(cpu_family: CpuFamily, non_coherent: bool, flush_slow: bool, snoop_ok: bool) -> u16 {
    match cpu_family {
        CpuFamily::EarlySixteenBit | CpuFamily::ProtectedSixteenBit => 256,
        CpuFamily::EarlyThirtyTwoBit => {
            if non_coherent {
                192
            } else {
                160
            }
        }
        CpuFamily::LateThirtyTwoBit => {
            if flush_slow {
                128
            } else {
                96
            }
        }
        CpuFamily::Superscalar => {
            if snoop_ok {
                64
            } else {
                96
            }
        }
    }
}
