//! 匹配判定
//!
//! 在分类结果上求值一条匹配规则：协议位图、比较字段、主协议存在性、
//! 错误匹配、取反，以及可选的主机名子串条件。

use crate::core::protocol::{ProtocolBitmask, ProtocolId, ProtocolPair, ProtocolRegistry};
use crate::error::{ClassifierError, Result};

/// 位图比较的字段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchField {
    /// 应用协议已知时比较应用协议和主协议，否则只比较主协议
    #[default]
    Any,
    /// 只比较应用协议
    App,
    /// 只比较主协议
    Master,
}

/// 主机名条件检查的字段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostScope {
    /// 只检查服务器主机名
    Host,
    /// 只检查证书名
    Certificate,
    /// 两者任一
    #[default]
    Both,
}

impl HostScope {
    /// 是否检查主机名
    pub fn includes_host(self) -> bool {
        matches!(self, Self::Host | Self::Both)
    }

    /// 是否检查证书名
    pub fn includes_certificate(self) -> bool {
        matches!(self, Self::Certificate | Self::Both)
    }
}

/// 一条协议匹配规则
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtocolMatch {
    protocols: ProtocolBitmask,
    field: MatchField,
    have_master: bool,
    error: bool,
    invert: bool,
    host: Option<(String, HostScope)>,
}

impl ProtocolMatch {
    /// 创建空规则
    pub fn new() -> Self {
        Self::default()
    }

    /// 由逗号分隔的协议名构造
    pub fn from_names(names: &str, registry: &ProtocolRegistry) -> Result<Self> {
        let mut rule = Self::new();
        for name in names.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            let id = registry
                .resolve(name)
                .ok_or_else(|| ClassifierError::unknown_protocol(name))?;
            rule.protocols.set(id);
        }
        Ok(rule)
    }

    /// 加入一个协议
    pub fn protocol(mut self, id: ProtocolId) -> Self {
        self.protocols.set(id);
        self
    }

    /// 设置比较字段
    pub fn field(mut self, field: MatchField) -> Self {
        self.field = field;
        self
    }

    /// 只要求主协议已知
    pub fn have_master(mut self) -> Self {
        self.have_master = true;
        self
    }

    /// 匹配处理出错的报文
    pub fn error(mut self) -> Self {
        self.error = true;
        self
    }

    /// 结果取反
    pub fn invert(mut self) -> Self {
        self.invert = true;
        self
    }

    /// 附加主机名子串条件
    pub fn host(mut self, needle: impl Into<String>, scope: HostScope) -> Self {
        self.host = Some((needle.into(), scope));
        self
    }

    /// 主机名条件
    pub fn host_condition(&self) -> Option<(&str, HostScope)> {
        self.host.as_ref().map(|(needle, scope)| (needle.as_str(), *scope))
    }

    /// 检查规则是否有意义
    ///
    /// 没有协议、没有主机名条件、也不是错误或主协议匹配时拒绝。
    pub fn check(&self) -> Result<()> {
        if !self.error && !self.have_master && self.host.is_none() && self.protocols.count() == 0 {
            return Err(ClassifierError::config_error("no selected protocols"));
        }
        if matches!(&self.host, Some((needle, _)) if needle.is_empty()) {
            return Err(ClassifierError::config_error("empty host condition"));
        }
        Ok(())
    }

    /// 求值
    ///
    /// `is_error` 表示本报文处理出错；`host_ok` 是主机名条件的结果，
    /// 没有主机名条件时应传 `true`。
    pub fn matches(&self, pair: &ProtocolPair, is_error: bool, host_ok: bool) -> bool {
        if self.error {
            return is_error ^ self.invert;
        }
        let hit = |id: ProtocolId| self.protocols.is_set(id);
        let result = if self.have_master {
            !pair.master.is_unknown()
        } else if self.protocols.count() == 0 {
            true
        } else {
            match self.field {
                MatchField::Master => hit(pair.master),
                MatchField::App => hit(pair.app),
                MatchField::Any if !pair.app.is_unknown() => {
                    hit(pair.app) || (!pair.master.is_unknown() && hit(pair.master))
                }
                MatchField::Any => hit(pair.master),
            }
        };
        (result && host_ok) ^ self.invert
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::ids;

    #[test]
    fn test_field_selection() {
        let pair = ProtocolPair::new(ids::HTTP, ids::TLS);
        let rule = ProtocolMatch::new().protocol(ids::TLS);
        assert!(rule.matches(&pair, false, true));
        assert!(!rule.clone().field(MatchField::App).matches(&pair, false, true));
        assert!(rule.clone().field(MatchField::Master).matches(&pair, false, true));
        assert!(!rule.clone().invert().matches(&pair, false, true));
    }

    #[test]
    fn test_error_and_master() {
        let rule = ProtocolMatch::new().error();
        assert!(rule.matches(&ProtocolPair::UNKNOWN, true, true));
        assert!(!rule.matches(&ProtocolPair::UNKNOWN, false, true));

        let rule = ProtocolMatch::new().have_master();
        assert!(rule.matches(&ProtocolPair::new(ids::HTTP, ids::DNS), false, true));
        assert!(!rule.matches(&ProtocolPair::app_only(ids::HTTP), false, true));
    }

    #[test]
    fn test_host_condition_and_check() {
        let pair = ProtocolPair::app_only(ids::TLS);
        let rule = ProtocolMatch::new().protocol(ids::TLS).host("example", HostScope::Both);
        assert!(!rule.matches(&pair, false, false));
        assert!(rule.check().is_ok());
        assert!(ProtocolMatch::new().check().is_err());
    }

    #[test]
    fn test_from_names() {
        let registry = ProtocolRegistry::new();
        let rule = ProtocolMatch::from_names("http, dns", &registry).unwrap();
        assert!(rule.matches(&ProtocolPair::app_only(ids::DNS), false, true));
        assert!(ProtocolMatch::from_names("nope", &registry).is_err());
    }
}
