//! 核心抽象模块
//!
//! 包含协议定义、探测器接口和端点上下文缓存。

pub mod detector;
pub mod endpoint;
pub mod magic;
pub mod protocol;
pub mod tls_sni;

pub use detector::{Direction, FlowState, NullDetector, ProtocolDetector};
pub use endpoint::{EndpointAddr, EndpointCache, EndpointContext, EndpointState};
pub use magic::{MagicSignature, SignatureDetector};
pub use protocol::{ids, L4Proto, ProtocolBitmask, ProtocolId, ProtocolPair, ProtocolRegistry, MAX_PROTOCOLS};
