//! 管理会话
//!
//! 三个管理通道（规则、端口范围、主机名）共用同一种文本会话：调用方可以
//! 按任意边界写入原始字节，会话负责拼行；也可以直接逐行提交。
//! 任何一行出错都会使整个会话作废，在线表保持不变。

use crate::engine::ClassificationEngine;
use crate::error::{ClassifierError, Result};
use crate::host::HostSession;
use crate::portrange::PortRangeSession;
use crate::rules::RuleSession;
use crate::{flow_debug, flow_error};
use std::fmt;

/// 管理通道
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdminChannel {
    /// 规则表
    Rules,
    /// 端口范围
    PortRanges,
    /// 主机名规则
    Hosts,
}

impl AdminChannel {
    /// 单条命令的最大长度（含结尾）
    pub fn max_command_len(self) -> usize {
        match self {
            Self::Rules => 256,
            Self::PortRanges | Self::Hosts => 4060,
        }
    }

    /// 通道名称
    pub fn name(self) -> &'static str {
        match self {
            Self::Rules => "rules",
            Self::PortRanges => "port ranges",
            Self::Hosts => "hosts",
        }
    }
}

impl fmt::Display for AdminChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug)]
enum Staged<'a> {
    Rules(RuleSession<'a>),
    PortRanges(PortRangeSession<'a>),
    Hosts(HostSession<'a>),
}

/// 管理会话
#[derive(Debug)]
pub struct AdminSession<'a> {
    channel: AdminChannel,
    staged: Staged<'a>,
    pending: Vec<u8>,
    too_long: bool,
    failed_at: Option<usize>,
    lines: usize,
}

impl ClassificationEngine {
    /// 打开可写管理会话
    ///
    /// 每个通道同一时刻只允许一个会话。
    pub fn open_admin(&self, channel: AdminChannel) -> Result<AdminSession<'_>> {
        let staged = match channel {
            AdminChannel::Rules => Staged::Rules(self.rules().open_session()?),
            AdminChannel::PortRanges => {
                Staged::PortRanges(self.port_ranges().open_session(self.rules().registry())?)
            }
            AdminChannel::Hosts => Staged::Hosts(self.hosts().open(true, self.rules().registry())?),
        };
        Ok(AdminSession {
            channel,
            staged,
            pending: Vec::new(),
            too_long: false,
            failed_at: None,
            lines: 0,
        })
    }
}

impl AdminSession<'_> {
    /// 会话通道
    pub fn channel(&self) -> AdminChannel {
        self.channel
    }

    /// 已执行的行数
    pub fn lines(&self) -> usize {
        self.lines
    }

    /// 会话是否已因错误作废
    pub fn is_failed(&self) -> bool {
        self.failed_at.is_some()
    }

    fn ensure_open(&self) -> Result<()> {
        match self.failed_at {
            Some(line) => Err(ClassifierError::session_closed(format!(
                "{} (failed at line {})",
                self.channel, line
            ))),
            None => Ok(()),
        }
    }

    /// 写入原始字节
    ///
    /// 以 `\n` 或 `\0` 结束一行；不完整的行留待下次写入。超长命令被整行拒绝。
    /// 返回消费的字节数。
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.ensure_open()?;
        let max = self.channel.max_command_len();
        for &byte in data {
            if byte == b'\n' || byte == 0 {
                let line = std::mem::take(&mut self.pending);
                if std::mem::take(&mut self.too_long) {
                    self.lines += 1;
                    flow_error!("{}: command too long", self.channel);
                    self.failed_at = Some(self.lines);
                    return Err(ClassifierError::syntax(
                        self.lines,
                        format!("command longer than {} bytes", max - 1),
                    ));
                }
                if !line.is_empty() {
                    let text = String::from_utf8_lossy(&line);
                    self.apply_line(&text)?;
                }
            } else if self.pending.len() < max - 1 {
                self.pending.push(byte);
            } else {
                self.too_long = true;
            }
        }
        Ok(data.len())
    }

    /// 执行一行命令
    pub fn apply_line(&mut self, line: &str) -> Result<()> {
        self.ensure_open()?;
        self.lines += 1;
        let result = match &mut self.staged {
            Staged::Rules(session) => session.apply_line(line),
            Staged::PortRanges(session) => session.apply_line(line),
            Staged::Hosts(session) => session.apply_line(line),
        };
        if let Err(err) = &result {
            flow_error!("{} line {}: {}", self.channel, self.lines, err);
            self.failed_at = Some(self.lines);
        }
        result
    }

    /// 提交会话
    ///
    /// 未以换行结束的最后一行也会被执行。
    pub fn commit(mut self) -> Result<()> {
        if !self.pending.is_empty() || self.too_long {
            self.write(b"\n")?;
        }
        self.ensure_open()?;
        let channel = self.channel;
        let lines = self.lines;
        match self.staged {
            Staged::Rules(session) => session.commit()?,
            Staged::PortRanges(session) => session.commit()?,
            Staged::Hosts(session) => session.close()?,
        }
        flow_debug!("{} session committed ({} lines)", channel, lines);
        Ok(())
    }

    /// 放弃会话
    pub fn abort(self) {
        flow_debug!("{} session aborted after {} lines", self.channel, self.lines);
    }
}
