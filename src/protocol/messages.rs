use bytes::Buf;

use crate::error::{ReplicationError, Result, ServerError};

/// Parse an `ErrorResponse` / `NoticeResponse` body.
///
/// Fields are `(code_byte, cstring)` pairs terminated by a zero byte.
pub fn parse_error_response(payload: &[u8]) -> ServerError {
    let mut b = payload;
    let mut out = ServerError::default();
    let mut severity_localized = None;
    let mut message = None;

    while let Some((&code, rest)) = b.split_first() {
        if code == 0 {
            break;
        }
        let Some(pos) = rest.iter().position(|&x| x == 0) else {
            break;
        };
        let s = String::from_utf8_lossy(&rest[..pos]).into_owned();
        match code {
            b'S' => severity_localized = Some(s),
            b'V' => out.severity = Some(s),
            b'C' => out.code = Some(s),
            b'M' => message = Some(s),
            b'D' => out.detail = Some(s),
            b'H' => out.hint = Some(s),
            _ => {}
        }
        b = &rest[pos + 1..];
    }

    if out.severity.is_none() {
        out.severity = severity_localized;
    }
    out.message = message.unwrap_or_else(|| "unknown server error".to_string());
    out
}

pub fn parse_auth_request(payload: &[u8]) -> Result<(i32, &[u8])> {
    if payload.len() < 4 {
        return Err(ReplicationError::Protocol("auth request too short".into()));
    }
    let mut b = payload;
    let code = b.get_i32();
    Ok((code, b))
}

/// Parse a `DataRow` body into text columns (`None` for SQL NULL).
pub fn parse_data_row(payload: &[u8]) -> Result<Vec<Option<String>>> {
    let short = || ReplicationError::Protocol("DataRow truncated".into());

    let mut b = payload;
    if b.remaining() < 2 {
        return Err(short());
    }
    let count = b.get_i16();
    let mut cols = Vec::with_capacity(count.max(0) as usize);
    for _ in 0..count {
        if b.remaining() < 4 {
            return Err(short());
        }
        let len = b.get_i32();
        if len < 0 {
            cols.push(None);
            continue;
        }
        let len = len as usize;
        if b.remaining() < len {
            return Err(short());
        }
        cols.push(Some(String::from_utf8_lossy(&b[..len]).into_owned()));
        b.advance(len);
    }
    Ok(cols)
}

/// Parse a `CommandComplete` body (a single cstring tag).
pub fn parse_command_tag(payload: &[u8]) -> String {
    let end = payload.iter().position(|&x| x == 0).unwrap_or(payload.len());
    String::from_utf8_lossy(&payload[..end]).into_owned()
}

/// Parse the mechanism list of an `AuthenticationSASL` request.
pub fn parse_sasl_mechanisms(mut b: &[u8]) -> Vec<String> {
    let mut offered = Vec::new();
    while let Some(pos) = b.iter().position(|&x| x == 0) {
        if pos == 0 {
            break;
        }
        offered.push(String::from_utf8_lossy(&b[..pos]).into_owned());
        b = &b[pos + 1..];
    }
    offered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_collects_fields() {
        let mut payload = Vec::new();
        payload.extend_from_slice(b"SERROR\0");
        payload.extend_from_slice(b"VERROR\0");
        payload.extend_from_slice(b"C42710\0");
        payload.extend_from_slice(b"Mreplication slot \"s\" already exists\0");
        payload.extend_from_slice(b"Hdrop it first\0");
        payload.push(0);

        let e = parse_error_response(&payload);
        assert_eq!(e.severity.as_deref(), Some("ERROR"));
        assert_eq!(e.code.as_deref(), Some("42710"));
        assert!(e.message.contains("already exists"));
        assert_eq!(e.hint.as_deref(), Some("drop it first"));
        assert!(e.is_already_exists());
    }

    #[test]
    fn parse_error_without_message() {
        let e = parse_error_response(b"C12345\0\0");
        assert_eq!(e.message, "unknown server error");
        assert!(e.to_string().contains("SQLSTATE 12345"));
    }

    #[test]
    fn parse_error_stops_on_unterminated_field() {
        let e = parse_error_response(b"Mhello");
        assert_eq!(e.message, "unknown server error");
    }

    #[test]
    fn parse_data_row_with_null() {
        let mut p = Vec::new();
        p.extend_from_slice(&3i16.to_be_bytes());
        p.extend_from_slice(&2i32.to_be_bytes());
        p.extend_from_slice(b"42");
        p.extend_from_slice(&(-1i32).to_be_bytes());
        p.extend_from_slice(&9i32.to_be_bytes());
        p.extend_from_slice(b"0/16B6C50");

        let cols = parse_data_row(&p).unwrap();
        assert_eq!(
            cols,
            vec![Some("42".to_string()), None, Some("0/16B6C50".to_string())]
        );
    }

    #[test]
    fn parse_data_row_truncated() {
        let mut p = Vec::new();
        p.extend_from_slice(&1i16.to_be_bytes());
        p.extend_from_slice(&10i32.to_be_bytes());
        p.extend_from_slice(b"short");
        assert!(parse_data_row(&p).is_err());
    }

    #[test]
    fn parse_command_tag_strips_terminator() {
        assert_eq!(parse_command_tag(b"CREATE_REPLICATION_SLOT\0"), "CREATE_REPLICATION_SLOT");
    }

    #[test]
    fn parse_sasl_mechanism_list() {
        let m = parse_sasl_mechanisms(b"SCRAM-SHA-256-PLUS\0SCRAM-SHA-256\0\0");
        assert_eq!(m, vec!["SCRAM-SHA-256-PLUS", "SCRAM-SHA-256"]);
    }

    #[test]
    fn parse_auth_request_too_short() {
        assert!(parse_auth_request(&[0, 0]).is_err());
        let (code, rest) = parse_auth_request(&[0, 0, 0, 10, b'x']).unwrap();
        assert_eq!(code, 10);
        assert_eq!(rest, b"x");
    }
}
