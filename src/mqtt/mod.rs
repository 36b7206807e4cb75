pub mod client;

use device_worker::CommandOutcome;

/// Something the bridge wants published for one device.
#[derive(Debug, Clone)]
pub enum Publication {
    /// Latest cached value of one attribute.
    State {
        topic_name: String,
        attribute: String,
        value: String,
    },
    Outcome {
        topic_name: String,
        outcome: CommandOutcome,
    },
    Connection {
        topic_name: String,
        connected: bool,
    },
}
