#![allow(dead_code, unused_imports)]

pub mod guardian;
pub mod sim_chain;
pub mod vaa_builder;

pub use guardian::*;
pub use sim_chain::*;
pub use vaa_builder::*;

use messenger_core::config::ConfirmationConfig;

/// 测试用的快速确认轮询
pub fn fast_confirmation() -> ConfirmationConfig {
    ConfirmationConfig {
        poll_interval_ms: 5,
        max_polls: 20,
    }
}
