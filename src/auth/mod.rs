//! Password authentication for the default connector.
//!
//! Supported `AuthenticationRequest` codes:
//! - 0: ok
//! - 3: cleartext password
//! - 5: MD5 (feature `md5`)
//! - 10/11/12: SASL with SCRAM-SHA-256 (feature `scram`)
//!
//! GSSAPI, SSPI and SCRAM channel binding are not supported; certificate
//! authentication happens at the TLS layer.

#[cfg(feature = "scram")]
pub mod scram;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::error::{ReplicationError, Result};
use crate::protocol::framing::{read_backend_message, write_password_message};
use crate::protocol::messages::{parse_auth_request, parse_error_response, parse_sasl_mechanisms};

const AUTH_OK: i32 = 0;
const AUTH_CLEARTEXT: i32 = 3;
const AUTH_MD5: i32 = 5;
const AUTH_SASL: i32 = 10;
#[cfg(feature = "scram")]
const AUTH_SASL_CONTINUE: i32 = 11;
#[cfg(feature = "scram")]
const AUTH_SASL_FINAL: i32 = 12;

/// Drive the authentication exchange until the server is ready for queries.
pub async fn authenticate<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    user: &str,
    password: &str,
) -> Result<()> {
    loop {
        let msg = read_backend_message(stream).await?;
        match msg.tag {
            b'R' => {
                let (code, rest) = parse_auth_request(&msg.payload)?;
                match code {
                    AUTH_OK => debug!("authenticated as {user}"),
                    AUTH_CLEARTEXT => {
                        write_password_message(stream, &cstring(password)).await?;
                    }
                    AUTH_MD5 => md5_response(stream, user, password, rest).await?,
                    AUTH_SASL => sasl_exchange(stream, user, password, rest).await?,
                    _ => {
                        return Err(ReplicationError::Auth(format!(
                            "unsupported auth method: {code}"
                        )));
                    }
                }
            }
            b'E' => return Err(ReplicationError::Server(parse_error_response(&msg.payload))),
            b'Z' => return Ok(()), // ReadyForQuery
            _ => {}                // ParameterStatus, BackendKeyData, NoticeResponse
        }
    }
}

fn cstring(s: &str) -> Vec<u8> {
    let mut v = Vec::with_capacity(s.len() + 1);
    v.extend_from_slice(s.as_bytes());
    v.push(0);
    v
}

#[cfg(feature = "md5")]
async fn md5_response<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    user: &str,
    password: &str,
    salt: &[u8],
) -> Result<()> {
    let salt: [u8; 4] = salt
        .try_into()
        .map_err(|_| ReplicationError::Protocol("md5 auth salt missing".into()))?;
    write_password_message(stream, &cstring(&postgres_md5(password, user, &salt))).await
}

#[cfg(not(feature = "md5"))]
async fn md5_response<S: AsyncRead + AsyncWrite + Unpin>(
    _stream: &mut S,
    _user: &str,
    _password: &str,
    _salt: &[u8],
) -> Result<()> {
    Err(ReplicationError::Auth("md5 feature disabled".into()))
}

/// `"md5" + md5(md5(password + user) + salt)`, hex encoded.
#[cfg(feature = "md5")]
fn postgres_md5(password: &str, user: &str, salt: &[u8; 4]) -> String {
    let inner = format!("{:x}", md5::compute(format!("{password}{user}")));
    let mut outer = inner.into_bytes();
    outer.extend_from_slice(salt);
    format!("md5{:x}", md5::compute(outer))
}

#[cfg(feature = "scram")]
async fn sasl_exchange<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    user: &str,
    password: &str,
    mechanisms: &[u8],
) -> Result<()> {
    use scram::{MECHANISM, ScramSha256};

    let offered = parse_sasl_mechanisms(mechanisms);
    if !offered.iter().any(|m| m == MECHANISM) {
        return Err(ReplicationError::Auth(format!(
            "server does not offer {MECHANISM}: {offered:?}"
        )));
    }

    let scram = ScramSha256::new(user);
    let first = scram.client_first();

    // SASLInitialResponse: mechanism\0 + int32 length + client-first
    let mut init = cstring(MECHANISM);
    init.extend_from_slice(&(first.len() as i32).to_be_bytes());
    init.extend_from_slice(first.as_bytes());
    write_password_message(stream, &init).await?;

    let server_first = read_sasl_step(stream, AUTH_SASL_CONTINUE).await?;
    let (client_final, verifier) = scram.client_final(password, &server_first)?;
    write_password_message(stream, client_final.as_bytes()).await?;

    let server_final = read_sasl_step(stream, AUTH_SASL_FINAL).await?;
    verifier.verify(&server_final)
}

#[cfg(not(feature = "scram"))]
async fn sasl_exchange<S: AsyncRead + AsyncWrite + Unpin>(
    _stream: &mut S,
    _user: &str,
    _password: &str,
    mechanisms: &[u8],
) -> Result<()> {
    Err(ReplicationError::Auth(format!(
        "SCRAM feature disabled; server offers {:?}",
        parse_sasl_mechanisms(mechanisms)
    )))
}

#[cfg(feature = "scram")]
async fn read_sasl_step<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    want: i32,
) -> Result<String> {
    loop {
        let msg = read_backend_message(stream).await?;
        match msg.tag {
            b'R' => {
                let (code, rest) = parse_auth_request(&msg.payload)?;
                if code != want {
                    return Err(ReplicationError::Auth(format!(
                        "unexpected auth code {code}, expected {want}"
                    )));
                }
                return Ok(String::from_utf8_lossy(rest).into_owned());
            }
            b'E' => return Err(ReplicationError::Server(parse_error_response(&msg.payload))),
            _ => {}
        }
    }
}
