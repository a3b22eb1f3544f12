// src/gcode/mod.rs
pub mod command;
pub mod parser;
pub mod protocol;
pub mod queue;
pub mod receiver;

pub use command::{Command, Param, ParamMask};
pub use parser::{checksum, parse_line, ParserConfig};
pub use protocol::{DeliveryProtocol, Response, Verdict};
pub use queue::{CommandQueue, Dequeued, EmergencyStop, Enqueued, SharedQueue};
pub use receiver::{CommandReceiver, LineBuffer};
