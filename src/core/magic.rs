//! 魔法字节探测器
//!
//! 基于报文开头的魔法字节进行轻量探测，同时提取HTTP Host与TLS SNI。
//! 这是一个参考探测器实现，真实部署可以替换为完整的DPI引擎。

use crate::core::detector::{FlowState, ProtocolDetector};
use crate::core::endpoint::EndpointContext;
use crate::core::protocol::{ids, ProtocolBitmask, ProtocolId, ProtocolPair};
use crate::core::tls_sni;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// 魔法字节特征
#[derive(Debug, Clone)]
pub struct MagicSignature {
    /// 协议编号
    pub protocol: ProtocolId,
    /// 魔法字节序列
    pub magic_bytes: Vec<u8>,
    /// 字节偏移量
    pub offset: usize,
    /// 是否区分大小写
    pub case_sensitive: bool,
}

impl MagicSignature {
    /// 创建新的特征
    pub fn new(protocol: ProtocolId, magic_bytes: &[u8], offset: usize) -> Self {
        Self {
            protocol,
            magic_bytes: magic_bytes.to_vec(),
            offset,
            case_sensitive: true,
        }
    }

    /// 不区分大小写
    pub fn case_insensitive(mut self) -> Self {
        self.case_sensitive = false;
        self
    }

    /// 检测数据是否匹配此特征
    pub fn matches(&self, data: &[u8]) -> bool {
        let end = self.offset + self.magic_bytes.len();
        let Some(window) = data.get(self.offset..end) else {
            return false;
        };
        if self.case_sensitive {
            window == self.magic_bytes.as_slice()
        } else {
            window.eq_ignore_ascii_case(&self.magic_bytes)
        }
    }
}

/// 魔法字节探测器
#[derive(Debug)]
pub struct SignatureDetector {
    /// 按第一字节索引的特征表
    byte_indexed: HashMap<u8, Vec<MagicSignature>>,
    /// 偏移量非零的特征
    offset_signatures: Vec<MagicSignature>,
    /// 当前启用的协议，None表示全部启用
    enabled: RwLock<Option<ProtocolBitmask>>,
}

impl Default for SignatureDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl SignatureDetector {
    /// 创建并加载常见特征
    pub fn new() -> Self {
        let mut detector = Self {
            byte_indexed: HashMap::new(),
            offset_signatures: Vec::new(),
            enabled: RwLock::new(None),
        };
        detector.load_common_signatures();
        detector
    }

    fn load_common_signatures(&mut self) {
        let signatures = [
            MagicSignature::new(ids::HTTP, b"GET ", 0),
            MagicSignature::new(ids::HTTP, b"POST ", 0),
            MagicSignature::new(ids::HTTP, b"PUT ", 0),
            MagicSignature::new(ids::HTTP, b"HEAD ", 0),
            MagicSignature::new(ids::HTTP, b"OPTIONS ", 0),
            MagicSignature::new(ids::HTTP, b"DELETE ", 0),
            MagicSignature::new(ids::HTTP, b"HTTP/1.", 0),
            MagicSignature::new(ids::SSH, b"SSH-", 0),
            MagicSignature::new(ids::SMTP, b"EHLO ", 0).case_insensitive(),
            MagicSignature::new(ids::SMTP, b"HELO ", 0).case_insensitive(),
            MagicSignature::new(ids::MQTT, b"MQTT", 4),
        ];
        for signature in signatures {
            self.add_signature(signature);
        }
    }

    /// 添加特征
    pub fn add_signature(&mut self, signature: MagicSignature) {
        if signature.offset == 0 {
            if let Some(&first) = signature.magic_bytes.first() {
                let keys = if signature.case_sensitive {
                    vec![first]
                } else {
                    vec![first.to_ascii_lowercase(), first.to_ascii_uppercase()]
                };
                for key in keys {
                    self.byte_indexed.entry(key).or_default().push(signature.clone());
                }
                return;
            }
        }
        self.offset_signatures.push(signature);
    }

    fn is_enabled(&self, id: ProtocolId) -> bool {
        self.enabled
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|mask| mask.is_set(id))
            .unwrap_or(true)
    }

    fn match_signature(&self, data: &[u8]) -> Option<ProtocolId> {
        let first = *data.first()?;
        self.byte_indexed
            .get(&first)
            .into_iter()
            .flatten()
            .chain(self.offset_signatures.iter())
            .find(|sig| sig.matches(data))
            .map(|sig| sig.protocol)
    }
}

/// 提取HTTP请求中的Host头
fn extract_http_host(data: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(data).ok()?;
    text.split("\r\n")
        .skip(1)
        .take_while(|line| !line.is_empty())
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case("host")
                .then(|| value.trim().to_ascii_lowercase())
        })
}

impl ProtocolDetector for SignatureDetector {
    fn classify(
        &self,
        state: &mut FlowState,
        payload: &[u8],
        _timestamp: u64,
        _src: &EndpointContext,
        _dst: &EndpointContext,
    ) -> ProtocolPair {
        if payload.is_empty() {
            return ProtocolPair::UNKNOWN;
        }

        if tls_sni::is_handshake_record(payload) && self.is_enabled(ids::TLS) {
            if let Some(sni) = tls_sni::extract_sni(payload) {
                state.host_server_name = Some(sni);
            }
            state.detection_complete = true;
            return ProtocolPair::app_only(ids::TLS);
        }

        match self.match_signature(payload) {
            Some(id) if self.is_enabled(id) => {
                if id == ids::HTTP {
                    state.host_server_name = extract_http_host(payload);
                    state.parsed_lines += 1;
                }
                state.detection_complete = true;
                ProtocolPair::app_only(id)
            }
            _ => ProtocolPair::UNKNOWN,
        }
    }

    fn set_enabled_protocols(&self, enabled: &ProtocolBitmask) {
        *self.enabled.write().unwrap_or_else(PoisonError::into_inner) = Some(enabled.clone());
    }

    fn name(&self) -> &str {
        "signature"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::endpoint::EndpointCache;

    #[test]
    fn test_http_host_extraction() {
        let cache = EndpointCache::new(0);
        let a = cache.insert_or_get("10.0.0.1".parse::<std::net::IpAddr>().unwrap()).unwrap();
        let b = cache.insert_or_get("10.0.0.2".parse::<std::net::IpAddr>().unwrap()).unwrap();

        let detector = SignatureDetector::new();
        let mut state = FlowState::new();
        let pair = detector.classify(
            &mut state,
            b"GET / HTTP/1.1\r\nHost: WWW.Example.org\r\n\r\n",
            0,
            &a,
            &b,
        );
        assert_eq!(pair.app, ids::HTTP);
        assert_eq!(state.host_server_name.as_deref(), Some("www.example.org"));
        assert!(state.detection_complete);
    }

    #[test]
    fn test_disabled_protocol_not_reported() {
        let cache = EndpointCache::new(0);
        let a = cache.insert_or_get("10.0.0.1".parse::<std::net::IpAddr>().unwrap()).unwrap();

        let detector = SignatureDetector::new();
        let mut mask = ProtocolBitmask::new();
        mask.set(ids::TLS);
        detector.set_enabled_protocols(&mask);

        let mut state = FlowState::new();
        assert!(detector.classify(&mut state, b"SSH-2.0-OpenSSH", 0, &a, &a).is_unknown());
    }
}
