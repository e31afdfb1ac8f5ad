//! TLS ClientHello解析
//!
//! 从ClientHello的server_name扩展中提取主机名，供主机规则匹配使用。

/// TLS记录类型：握手
const RECORD_HANDSHAKE: u8 = 0x16;
/// 握手类型：ClientHello
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
/// 扩展类型：server_name
const EXT_SERVER_NAME: u16 = 0x0000;
/// server_name列表中的host_name类型
const NAME_TYPE_HOST: u8 = 0x00;

/// 是否看起来像TLS握手记录
pub fn is_handshake_record(data: &[u8]) -> bool {
    data.len() >= 5 && data[0] == RECORD_HANDSHAKE && data[1] == 0x03 && data[2] <= 0x04
}

/// 提取ClientHello中的SNI
///
/// 记录不完整时尽量使用已到达的部分。
pub fn extract_sni(data: &[u8]) -> Option<String> {
    if !is_handshake_record(data) {
        return None;
    }

    let record_length = u16::from_be_bytes([data[3], data[4]]) as usize;
    let handshake = if data.len() < 5 + record_length {
        &data[5..]
    } else {
        &data[5..5 + record_length]
    };

    if handshake.first() != Some(&HANDSHAKE_CLIENT_HELLO) {
        return None;
    }

    let extensions = client_hello_extensions(handshake)?;
    find_server_name(extensions)
}

/// 跳过ClientHello的固定部分，返回扩展区
fn client_hello_extensions(handshake: &[u8]) -> Option<&[u8]> {
    // 握手类型(1) + 长度(3) + 版本(2) + 随机数(32)
    let mut pos = 1 + 3 + 2 + 32;

    // 会话ID
    let session_id_len = *handshake.get(pos)? as usize;
    pos += 1 + session_id_len;

    // 密码套件
    let suites = handshake.get(pos..pos + 2)?;
    pos += 2 + u16::from_be_bytes([suites[0], suites[1]]) as usize;

    // 压缩方法
    let compression_len = *handshake.get(pos)? as usize;
    pos += 1 + compression_len;

    let ext_len = handshake.get(pos..pos + 2)?;
    let extensions_length = u16::from_be_bytes([ext_len[0], ext_len[1]]) as usize;
    pos += 2;

    let end = (pos + extensions_length).min(handshake.len());
    handshake.get(pos..end).filter(|ext| !ext.is_empty())
}

fn find_server_name(extensions: &[u8]) -> Option<String> {
    let mut pos = 0;
    while pos + 4 <= extensions.len() {
        let ext_type = u16::from_be_bytes([extensions[pos], extensions[pos + 1]]);
        let ext_len = u16::from_be_bytes([extensions[pos + 2], extensions[pos + 3]]) as usize;
        pos += 4;

        if pos + ext_len > extensions.len() {
            break;
        }

        if ext_type == EXT_SERVER_NAME {
            return parse_server_name_list(&extensions[pos..pos + ext_len]);
        }

        pos += ext_len;
    }
    None
}

fn parse_server_name_list(data: &[u8]) -> Option<String> {
    let list_len = u16::from_be_bytes([*data.first()?, *data.get(1)?]) as usize;
    let list = data.get(2..2 + list_len)?;

    let mut pos = 0;
    while pos + 3 <= list.len() {
        let name_type = list[pos];
        let name_len = u16::from_be_bytes([list[pos + 1], list[pos + 2]]) as usize;
        pos += 3;
        let name = list.get(pos..pos + name_len)?;
        if name_type == NAME_TYPE_HOST {
            return std::str::from_utf8(name).ok().map(str::to_ascii_lowercase);
        }
        pos += name_len;
    }
    None
}

/// 构造带SNI的最小ClientHello，测试和基准使用
#[doc(hidden)]
pub fn build_client_hello(server_name: &str) -> Vec<u8> {
    let name = server_name.as_bytes();

    let mut sni = Vec::new();
    sni.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
    sni.push(NAME_TYPE_HOST);
    sni.extend_from_slice(&(name.len() as u16).to_be_bytes());
    sni.extend_from_slice(name);

    let mut extensions = Vec::new();
    extensions.extend_from_slice(&EXT_SERVER_NAME.to_be_bytes());
    extensions.extend_from_slice(&(sni.len() as u16).to_be_bytes());
    extensions.extend_from_slice(&sni);

    let mut body = Vec::new();
    body.extend_from_slice(&[0x03, 0x03]);
    body.extend_from_slice(&[0u8; 32]);
    body.push(0); // 会话ID
    body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // 一个密码套件
    body.extend_from_slice(&[0x01, 0x00]); // 压缩方法
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut handshake = vec![HANDSHAKE_CLIENT_HELLO];
    let len = body.len() as u32;
    handshake.extend_from_slice(&len.to_be_bytes()[1..]);
    handshake.extend_from_slice(&body);

    let mut record = vec![RECORD_HANDSHAKE, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}
