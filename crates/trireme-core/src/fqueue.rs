//! User-space packet queue parameters.
//!
//! The datapath owns these values; the supervisor holds a read-only
//! copy captured at construction and renders them into the
//! queue-balance arguments of its trap rules.

use serde::{Deserialize, Serialize};

/// Default mark set on packets re-injected by the datapath.
pub const DEFAULT_QUEUE_MARK: u32 = 0x1111;

/// Connmark applied to flows whose handshake completed, matched by the
/// established-accept rules.
pub const DEFAULT_CONN_MARK: u32 = 0x0570;

/// Queue ranges and marks of the user-space packet path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterQueueConfig {
    /// First queue of the application (outbound) side.
    pub app_queue_base: u16,
    /// Queues per class on the application side.
    pub app_queue_count: u16,
    /// First queue of the network (inbound) side.
    pub net_queue_base: u16,
    /// Queues per class on the network side.
    pub net_queue_count: u16,
    /// Mark exempting datapath-emitted packets from re-capture.
    pub mark_value: u32,
}

impl Default for FilterQueueConfig {
    fn default() -> Self {
        Self {
            app_queue_base: 0,
            app_queue_count: 4,
            net_queue_base: 12,
            net_queue_count: 4,
            mark_value: DEFAULT_QUEUE_MARK,
        }
    }
}

impl FilterQueueConfig {
    fn balance(base: u16, count: u16) -> String {
        format!("{}:{}", base, base + count.saturating_sub(1))
    }

    /// Queue-balance range for application-side SYN packets.
    #[must_use]
    pub fn app_syn_balance(&self) -> String {
        Self::balance(self.app_queue_base, self.app_queue_count)
    }

    /// Queue-balance range for application-side ACK-class packets.
    #[must_use]
    pub fn app_ack_balance(&self) -> String {
        Self::balance(
            self.app_queue_base + self.app_queue_count,
            self.app_queue_count,
        )
    }

    /// Queue-balance range for application-side SYN/ACK packets.
    #[must_use]
    pub fn app_synack_balance(&self) -> String {
        Self::balance(
            self.app_queue_base + 2 * self.app_queue_count,
            self.app_queue_count,
        )
    }

    /// Queue-balance range for network-side SYN packets.
    #[must_use]
    pub fn net_syn_balance(&self) -> String {
        Self::balance(self.net_queue_base, self.net_queue_count)
    }

    /// Queue-balance range for network-side ACK-class packets.
    #[must_use]
    pub fn net_ack_balance(&self) -> String {
        Self::balance(
            self.net_queue_base + self.net_queue_count,
            self.net_queue_count,
        )
    }

    /// Queue-balance range for network-side SYN/ACK packets.
    #[must_use]
    pub fn net_synack_balance(&self) -> String {
        Self::balance(
            self.net_queue_base + 2 * self.net_queue_count,
            self.net_queue_count,
        )
    }

    /// Total number of queues across both sides.
    #[must_use]
    pub fn total_queues(&self) -> u16 {
        3 * (self.app_queue_count + self.net_queue_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ranges_do_not_overlap() {
        let fq = FilterQueueConfig::default();

        assert_eq!(fq.app_syn_balance(), "0:3");
        assert_eq!(fq.app_ack_balance(), "4:7");
        assert_eq!(fq.app_synack_balance(), "8:11");
        assert_eq!(fq.net_syn_balance(), "12:15");
        assert_eq!(fq.net_ack_balance(), "16:19");
        assert_eq!(fq.net_synack_balance(), "20:23");
        assert_eq!(fq.total_queues(), 24);
    }

    #[test]
    fn test_single_queue_balance() {
        let fq = FilterQueueConfig {
            app_queue_base: 0,
            app_queue_count: 1,
            net_queue_base: 3,
            net_queue_count: 1,
            mark_value: DEFAULT_QUEUE_MARK,
        };

        assert_eq!(fq.app_syn_balance(), "0:0");
        assert_eq!(fq.net_syn_balance(), "3:3");
    }
}
