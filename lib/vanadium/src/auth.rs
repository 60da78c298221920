use crate::error::{DriverError, DriverResult};
use crate::net::codec::{Opcode, Packet, Status};
use crate::net::connection::{Connection, ConnectionState};
use ballast::crypto;
use ballast::encoding::base64;
use std::io::{Read, Write};

const SCRAM_MECH: &str = "SCRAM-SHA1";
const PLAIN_MECH: &str = "PLAIN";

/// GS2 header for a client that neither supports nor uses channel binding.
const GS2_HEADER: &str = "n,,";
/// The same header, base64-encoded, as sent in the final message.
const CHANNEL_BINDING: &str = "c=biws";

const SALTED_KEY_LEN: usize = 20;
const NONCE_DIGITS: usize = 12;

/// Runs the full first-use handshake on a connected socket: mechanism
/// listing, SCRAM-SHA1 authentication (PLAIN fallback), then bucket
/// selection. Any failure closes the connection.
pub fn authenticate<S: Read + Write>(
    conn: &mut Connection<S>,
    username: &str,
    password: &str,
    bucket: &str,
) -> DriverResult<()> {
    let mechanisms = sasl_list(conn)?;

    if mechanisms.contains("SCRAM-SHA") {
        let nonce = base64::encode(crypto::random_digits(NONCE_DIGITS));
        scram_auth(conn, username, password, &nonce)?;
    } else {
        plain_auth(conn, username, password)?;
    }

    select_bucket(conn, username, bucket)
}

/// Lists the SASL mechanisms the server advertises. Fails unless PLAIN or a
/// SCRAM-SHA variant is present.
fn sasl_list<S: Read + Write>(conn: &mut Connection<S>) -> DriverResult<String> {
    let request = Packet::request(Opcode::SaslList);
    let response = conn.roundtrip(&request)?;

    if !response.status().is_ok() {
        return Err(fail(conn, auth_error("mechanism listing", &response)));
    }

    let mechanisms = String::from_utf8_lossy(&response.value).into_owned();

    if !mechanisms.contains(PLAIN_MECH) && !mechanisms.contains("SCRAM-SHA") {
        return Err(fail(
            conn,
            DriverError::Auth(format!("no supported mechanism in `{}`", mechanisms)),
        ));
    }

    conn.set_state(ConnectionState::AuthList);
    Ok(mechanisms)
}

/// SCRAM-SHA1 exchange per RFC 5802, proving the password without sending it
/// and verifying the server's signature in return.
fn scram_auth<S: Read + Write>(
    conn: &mut Connection<S>,
    username: &str,
    password: &str,
    nonce: &str,
) -> DriverResult<()> {
    let client_first_bare = format!("n={},r={}", escape_username(username), nonce);

    let mut request = Packet::request(Opcode::SaslAuth);
    request.key = SCRAM_MECH.as_bytes().to_vec();
    request.value = format!("{}{}", GS2_HEADER, client_first_bare).into_bytes();

    let response = conn.roundtrip(&request)?;

    let challenge = match response.status() {
        Status::Ok | Status::AuthContinue => String::from_utf8_lossy(&response.value).into_owned(),
        _ => return Err(fail(conn, auth_error("scram auth", &response))),
    };

    conn.set_state(ConnectionState::Authed);

    let parsed = match parse_challenge(&challenge) {
        Ok(parsed) => parsed,
        Err(err) => return Err(fail(conn, err)),
    };

    let salted = salted_password(password, &parsed.salt, parsed.iterations);
    let client_final_prefix = format!("{},r={}", CHANNEL_BINDING, parsed.nonce);
    let auth_message = format!("{},{},{}", client_first_bare, challenge, client_final_prefix);

    let mut step = Packet::request(Opcode::SaslStep);
    step.key = SCRAM_MECH.as_bytes().to_vec();
    step.value = format!(
        "{},p={}",
        client_final_prefix,
        client_proof(&salted, &auth_message)
    )
    .into_bytes();

    let response = conn.roundtrip(&step)?;

    if !response.status().is_ok() {
        return Err(fail(conn, auth_error("scram step", &response)));
    }

    let expected = server_signature(&salted, &auth_message);
    let body = String::from_utf8_lossy(&response.value).into_owned();
    let verified = body
        .split(',')
        .any(|field| field.strip_prefix("v=") == Some(expected.as_str()));

    if !verified {
        return Err(fail(conn, DriverError::BadServerSignature));
    }

    conn.set_state(ConnectionState::StepOk);
    Ok(())
}

/// PLAIN exchange: the credentials travel in the clear, NUL-terminated.
fn plain_auth<S: Read + Write>(
    conn: &mut Connection<S>,
    username: &str,
    password: &str,
) -> DriverResult<()> {
    let mut request = Packet::request(Opcode::SaslAuth);
    request.key = PLAIN_MECH.as_bytes().to_vec();

    let mut value = Vec::with_capacity(username.len() + password.len() + 2);
    value.extend_from_slice(username.as_bytes());
    value.push(0);
    value.extend_from_slice(password.as_bytes());
    value.push(0);
    request.value = value;

    let response = conn.roundtrip(&request)?;

    if !response.status().is_ok() {
        return Err(fail(conn, auth_error("plain auth", &response)));
    }

    // PLAIN completes the exchange in one message; there is no step.
    conn.set_state(ConnectionState::StepOk);
    Ok(())
}

/// Binds the connection to `bucket`. Skipped when the bucket name equals the
/// username (the SASL-per-bucket shortcut, where auth already bound it).
fn select_bucket<S: Read + Write>(
    conn: &mut Connection<S>,
    username: &str,
    bucket: &str,
) -> DriverResult<()> {
    if bucket == username {
        conn.set_state(ConnectionState::Ready);
        return Ok(());
    }

    let mut request = Packet::request(Opcode::SelectBucket);
    request.key = bucket.as_bytes().to_vec();

    let response = conn.roundtrip(&request)?;

    if !response.status().is_ok() {
        return Err(fail(conn, auth_error("select bucket", &response)));
    }

    conn.set_state(ConnectionState::Ready);
    Ok(())
}

/// SCRAM username escaping: `=` and `,` are reserved separators.
pub(crate) fn escape_username(username: &str) -> String {
    username.replace('=', "=3D").replace(',', "=2C")
}

pub(crate) struct ScramChallenge {
    pub nonce: String,
    pub salt: Vec<u8>,
    pub iterations: u32,
}

/// Parses the server-first message: `r=<nonce>,s=<salt>,i=<iterations>`.
pub(crate) fn parse_challenge(raw: &str) -> DriverResult<ScramChallenge> {
    let mut nonce = None;
    let mut salt = None;
    let mut iterations = None;

    for field in raw.split(',') {
        if let Some(value) = field.strip_prefix("r=") {
            nonce = Some(value.to_string());
        } else if let Some(value) = field.strip_prefix("s=") {
            let decoded = base64::decode(value)
                .map_err(|err| DriverError::Auth(format!("bad challenge salt: {}", err)))?;
            salt = Some(decoded);
        } else if let Some(value) = field.strip_prefix("i=") {
            let parsed = value
                .parse()
                .map_err(|err| DriverError::Auth(format!("bad iteration count: {}", err)))?;
            iterations = Some(parsed);
        }
    }

    match (nonce, salt, iterations) {
        (Some(nonce), Some(salt), Some(iterations)) => Ok(ScramChallenge {
            nonce,
            salt,
            iterations,
        }),
        _ => Err(DriverError::Auth(format!(
            "challenge missing fields: `{}`",
            raw
        ))),
    }
}

pub(crate) fn salted_password(password: &str, salt: &[u8], iterations: u32) -> Vec<u8> {
    crypto::pbkdf2_hmac_sha1(password.as_bytes(), salt, iterations, SALTED_KEY_LEN)
}

/// `base64(client_key XOR HMAC(SHA1(client_key), auth_message))`.
pub(crate) fn client_proof(salted: &[u8], auth_message: &str) -> String {
    let client_key = crypto::hmac_sha1(salted, b"Client Key");
    let stored_key = crypto::sha1_bin(&client_key);
    let client_sig = crypto::hmac_sha1(&stored_key, auth_message.as_bytes());
    base64::encode(crypto::xor_bytes(&client_key, &client_sig))
}

/// The `v=` value the server must present for the same auth message.
pub(crate) fn server_signature(salted: &[u8], auth_message: &str) -> String {
    let server_key = crypto::hmac_sha1(salted, b"Server Key");
    base64::encode(crypto::hmac_sha1(&server_key, auth_message.as_bytes()))
}

#[inline]
fn fail<S>(conn: &mut Connection<S>, err: DriverError) -> DriverError {
    conn.set_state(ConnectionState::Closed);
    err
}

fn auth_error(step: &str, response: &Packet) -> DriverError {
    let message = String::from_utf8_lossy(&response.value);

    DriverError::Auth(match message.is_empty() {
        true => format!("{}: {}", step, response.status()),
        _ => format!("{}: {}", step, message),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::tests::{encode_response, MockStream};

    // RFC 5802 example exchange (user `user`, password `pencil`).
    const RFC_NONCE: &str = "fyko+d2lbbFgONRv9qkxdawL";
    const RFC_CHALLENGE: &str = "r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,i=4096";
    const RFC_PROOF: &str = "v0X8v3Bz2T0CJGbJQyF0X+HI4Ts=";
    const RFC_SERVER_SIG: &str = "rmF9pqV8S7suAoZWja4dJRkFsKQ=";
    const RFC_AUTH_MESSAGE: &str = "n=user,r=fyko+d2lbbFgONRv9qkxdawL,\
         r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,i=4096,\
         c=biws,r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j";

    fn rfc_salted() -> Vec<u8> {
        salted_password("pencil", &base64::decode("QSXCR+Q6sek8bf92").unwrap(), 4096)
    }

    fn response(opcode: Opcode, status: Status, value: &[u8]) -> Vec<u8> {
        let mut packet = Packet::request(opcode);
        packet.vbucket_or_status = status.as_u16();
        packet.value = value.to_vec();
        encode_response(packet)
    }

    fn scripted_conn(script: Vec<Vec<u8>>) -> Connection<MockStream> {
        let incoming = script.concat();
        Connection::from_stream(MockStream::new(incoming), "127.0.0.1:11210:default".into(), None)
    }

    #[test]
    fn test_escape_username() {
        assert_eq!(escape_username("plain"), "plain");
        assert_eq!(escape_username("a=b"), "a=3Db");
        assert_eq!(escape_username("a,b"), "a=2Cb");
        assert_eq!(escape_username("=,"), "=3D=2C");
    }

    #[test]
    fn test_parse_challenge() {
        let parsed = parse_challenge(RFC_CHALLENGE).unwrap();

        assert_eq!(parsed.nonce, "fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j");
        assert_eq!(parsed.salt, base64::decode("QSXCR+Q6sek8bf92").unwrap());
        assert_eq!(parsed.iterations, 4096);
    }

    #[test]
    fn test_parse_challenge_missing_fields() {
        assert!(parse_challenge("r=abc,i=10").is_err());
        assert!(parse_challenge("").is_err());
    }

    #[test]
    fn test_parse_challenge_bad_salt() {
        assert!(parse_challenge("r=abc,s=!!!,i=10").is_err());
    }

    #[test]
    fn test_rfc5802_key_derivation() {
        let salted = rfc_salted();

        let hex: String = salted.iter().map(|byte| format!("{:02x}", byte)).collect();
        assert_eq!(hex, "1d96ee3a529b5a5f9e47c01f229a2cb8a6e15f7d");

        assert_eq!(client_proof(&salted, RFC_AUTH_MESSAGE), RFC_PROOF);
        assert_eq!(server_signature(&salted, RFC_AUTH_MESSAGE), RFC_SERVER_SIG);
    }

    #[test]
    fn test_scram_handshake_against_rfc_transcript() {
        let mut conn = scripted_conn(vec![
            response(
                Opcode::SaslAuth,
                Status::AuthContinue,
                RFC_CHALLENGE.as_bytes(),
            ),
            response(
                Opcode::SaslStep,
                Status::Ok,
                format!("v={}", RFC_SERVER_SIG).as_bytes(),
            ),
        ]);

        scram_auth(&mut conn, "user", "pencil", RFC_NONCE).unwrap();
        assert_eq!(conn.state(), ConnectionState::StepOk);
    }

    #[test]
    fn test_scram_rejects_bad_server_signature() {
        let mut conn = scripted_conn(vec![
            response(
                Opcode::SaslAuth,
                Status::AuthContinue,
                RFC_CHALLENGE.as_bytes(),
            ),
            response(Opcode::SaslStep, Status::Ok, b"v=AAAAAAAAAAAAAAAAAAAAAAAAAAA="),
        ]);

        match scram_auth(&mut conn, "user", "pencil", RFC_NONCE) {
            Err(DriverError::BadServerSignature) => (),
            other => panic!("Unexpected result {:?}", other),
        }

        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_scram_rejects_auth_error_status() {
        let mut conn = scripted_conn(vec![response(
            Opcode::SaslAuth,
            Status::AuthError,
            b"Auth failure",
        )]);

        match scram_auth(&mut conn, "user", "pencil", RFC_NONCE) {
            Err(DriverError::Auth(message)) => assert!(message.contains("Auth failure")),
            other => panic!("Unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_plain_authenticate_end_to_end() {
        let mut conn = scripted_conn(vec![
            response(Opcode::SaslList, Status::Ok, b"PLAIN"),
            response(Opcode::SaslAuth, Status::Ok, b"Authenticated"),
            response(Opcode::SelectBucket, Status::Ok, b""),
        ]);

        authenticate(&mut conn, "app", "secret", "beer-sample").unwrap();
        assert_eq!(conn.state(), ConnectionState::Ready);
    }

    #[test]
    fn test_plain_value_layout() {
        let mut conn = scripted_conn(vec![response(Opcode::SaslAuth, Status::Ok, b"ok")]);

        plain_auth(&mut conn, "user", "pass").unwrap();

        let sent = Packet::decode(&mut &conn_outgoing(&conn)[..]).unwrap();
        assert_eq!(sent.key, b"PLAIN");
        assert_eq!(sent.value, b"user\0pass\0");
    }

    #[test]
    fn test_select_bucket_skipped_for_sasl_per_bucket() {
        let mut conn = scripted_conn(vec![]);

        select_bucket(&mut conn, "bucket", "bucket").unwrap();
        assert_eq!(conn.state(), ConnectionState::Ready);
    }

    #[test]
    fn test_sasl_list_rejects_unknown_mechanisms() {
        let mut conn = scripted_conn(vec![response(Opcode::SaslList, Status::Ok, b"CRAM-MD5")]);

        match sasl_list(&mut conn) {
            Err(DriverError::Auth(message)) => assert!(message.contains("CRAM-MD5")),
            other => panic!("Unexpected result {:?}", other),
        }

        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    fn conn_outgoing(conn: &Connection<MockStream>) -> Vec<u8> {
        conn.raw_stream().outgoing.clone()
    }
}
