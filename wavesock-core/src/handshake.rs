//! WebSocket opening handshake
//!
//! Client request construction and validation of the server's answer, and
//! the server-side accept path with subprotocol negotiation, as defined in
//! RFC 6455 §4. All functions here are pure over [`RequestHead`] and
//! [`ResponseHead`]; the connection drives the socket I/O.

use crate::error::{HandshakeError, Result};
use crate::http::{RequestHead, ResponseHead};
use crate::protocol::constants::*;
use crate::protocol::http_header::*;
use base64::{engine::general_purpose, Engine as _};
use sha1::{Digest, Sha1};

/// Generate a random Sec-WebSocket-Key: 16 random bytes, base64-encoded
pub fn generate_key() -> String {
    use rand::RngCore;
    let mut key_bytes = [0u8; WEBSOCKET_KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key_bytes);
    general_purpose::STANDARD.encode(key_bytes)
}

/// Compute the Sec-WebSocket-Accept digest for a client key
pub fn accept_digest(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    general_purpose::STANDARD.encode(hasher.finalize())
}

/// Build the client upgrade request for `resource` on `host`
pub fn build_client_request(
    resource: &str,
    host: &str,
    origin: &str,
    key: &str,
    subprotocols: &[String],
) -> RequestHead {
    let mut request = RequestHead::new("GET", resource);
    request
        .headers
        .set(HOST, host)
        .set(ORIGIN, origin)
        .set(UPGRADE, "websocket")
        .set(CONNECTION, "Upgrade,keep-alive")
        .set(SEC_WEBSOCKET_KEY, key)
        .set(SEC_WEBSOCKET_VERSION, WEBSOCKET_VERSION)
        .set(USER_AGENT, AGENT);
    if !subprotocols.is_empty() {
        request.headers.set_values(SEC_WEBSOCKET_PROTOCOL, subprotocols);
    }
    request
}

/// Validate the server's answer to a client upgrade request.
///
/// Accepts iff the status is 101, the accept digest matches `key`, and the
/// returned subprotocol is consistent with the offered set: a non-empty
/// offer must be answered with exactly one of its entries, an empty offer
/// must not be answered with any. Returns the negotiated subprotocol.
pub fn validate_server_response(
    response: &ResponseHead,
    key: &str,
    offered: &[String],
) -> Result<Option<String>> {
    if response.status != 101 {
        return Err(HandshakeError::UnexpectedStatus(response.status).into());
    }

    let accept = response
        .headers
        .get(SEC_WEBSOCKET_ACCEPT)
        .ok_or(HandshakeError::MissingHeader(SEC_WEBSOCKET_ACCEPT))?;
    let expected = accept_digest(key);
    if accept != expected {
        return Err(HandshakeError::AcceptMismatch {
            expected,
            received: accept.to_string(),
        }
        .into());
    }

    let answered = response.headers.get(SEC_WEBSOCKET_PROTOCOL);
    match answered {
        None => {
            if offered.is_empty() {
                Ok(None)
            } else {
                Err(HandshakeError::SubprotocolMismatch.into())
            }
        }
        Some(name) => {
            if offered.iter().any(|p| p == name) {
                Ok(Some(name.to_string()))
            } else {
                Err(HandshakeError::SubprotocolMismatch.into())
            }
        }
    }
}

/// Accept a client upgrade request.
///
/// Requires method GET, `Upgrade: websocket` and a key. Negotiation picks
/// the first client-offered subprotocol present in `configured`; when
/// `configured` is non-empty and nothing matches the request is rejected,
/// when it is empty the header is ignored. Returns the 101 response head
/// and the negotiated subprotocol.
pub fn accept_request(
    request: &RequestHead,
    configured: &[String],
) -> Result<(ResponseHead, Option<String>)> {
    if request.method != "GET" {
        return Err(HandshakeError::UnexpectedMethod(request.method.clone()).into());
    }

    let upgrade = request
        .headers
        .get(UPGRADE)
        .ok_or(HandshakeError::MissingHeader(UPGRADE))?;
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return Err(HandshakeError::InvalidHeader {
            header: UPGRADE,
            value: upgrade.to_string(),
        }
        .into());
    }

    let key = request
        .headers
        .get(SEC_WEBSOCKET_KEY)
        .ok_or(HandshakeError::MissingHeader(SEC_WEBSOCKET_KEY))?;

    let offered = request.headers.values(SEC_WEBSOCKET_PROTOCOL);
    let subprotocol = if offered.is_empty() || configured.is_empty() {
        None
    } else {
        match offered.iter().find(|p| configured.contains(*p)) {
            Some(agreed) => Some(agreed.clone()),
            None => return Err(HandshakeError::SubprotocolMismatch.into()),
        }
    };

    let mut response = ResponseHead::new(101, "Switching Protocols");
    response
        .headers
        .set(SERVER, AGENT)
        .set(UPGRADE, "websocket")
        .set(CONNECTION, "Upgrade,keep-alive")
        .set(SEC_WEBSOCKET_ACCEPT, accept_digest(key))
        .set(SEC_WEBSOCKET_VERSION, WEBSOCKET_VERSION);
    if let Some(name) = &subprotocol {
        response.headers.set(SEC_WEBSOCKET_PROTOCOL, name.clone());
    }
    Ok((response, subprotocol))
}

/// The 400 response sent before failing a rejected upgrade
pub fn reject_response() -> ResponseHead {
    let mut response = ResponseHead::new(400, "Bad Request");
    response
        .headers
        .set(SERVER, AGENT)
        .set(CONNECTION, "close");
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn key_generation_is_valid_base64_of_16_bytes() {
        let key = generate_key();
        assert_eq!(key.len(), 24);
        let decoded = general_purpose::STANDARD.decode(&key).unwrap();
        assert_eq!(decoded.len(), WEBSOCKET_KEY_LEN);
    }

    #[test]
    fn accept_digest_matches_rfc_vector() {
        // RFC 6455 §1.3: "the sample nonce"
        assert_eq!(
            accept_digest("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn client_request_carries_required_headers() {
        let request = build_client_request(
            "/chat?x=1",
            "example.com:9000",
            "ws://example.com:9000",
            "dGhlIHNhbXBsZSBub25jZQ==",
            &strings(&["chat"]),
        );
        assert_eq!(request.method, "GET");
        assert_eq!(request.target, "/chat?x=1");
        assert_eq!(request.headers.get("host"), Some("example.com:9000"));
        assert_eq!(request.headers.get("upgrade"), Some("websocket"));
        assert_eq!(request.headers.get("connection"), Some("Upgrade,keep-alive"));
        assert_eq!(request.headers.get("sec-websocket-version"), Some("13"));
        assert_eq!(request.headers.get("sec-websocket-protocol"), Some("chat"));
        assert!(request.headers.get("user-agent").is_some());
    }

    fn upgrade_request(protocols: &[&str]) -> RequestHead {
        let mut request = RequestHead::new("GET", "/");
        request
            .headers
            .set(UPGRADE, "WebSocket")
            .set(SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
            .set(SEC_WEBSOCKET_VERSION, "13");
        if !protocols.is_empty() {
            request
                .headers
                .set_values(SEC_WEBSOCKET_PROTOCOL, &strings(protocols));
        }
        request
    }

    #[test]
    fn accept_computes_digest_and_negotiates_first_match() {
        let request = upgrade_request(&["superchat", "chat"]);
        let (response, subprotocol) =
            accept_request(&request, &strings(&["chat", "superchat"])).unwrap();
        assert_eq!(response.status, 101);
        assert_eq!(
            response.headers.get(SEC_WEBSOCKET_ACCEPT),
            Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=")
        );
        // first request-offered value wins, not first configured
        assert_eq!(subprotocol.as_deref(), Some("superchat"));
        assert_eq!(
            response.headers.get(SEC_WEBSOCKET_PROTOCOL),
            Some("superchat")
        );
    }

    #[test]
    fn accept_rejects_unmatched_offer_when_configured() {
        let request = upgrade_request(&["superChat"]);
        match accept_request(&request, &strings(&["chat"])) {
            Err(Error::Handshake(HandshakeError::SubprotocolMismatch)) => {}
            other => panic!("expected SubprotocolMismatch, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn accept_ignores_offer_when_unconfigured() {
        let request = upgrade_request(&["chat"]);
        let (response, subprotocol) = accept_request(&request, &[]).unwrap();
        assert_eq!(subprotocol, None);
        assert_eq!(response.headers.get(SEC_WEBSOCKET_PROTOCOL), None);
    }

    #[test]
    fn accept_requires_get_upgrade_and_key() {
        let mut request = upgrade_request(&[]);
        request.method = "POST".to_string();
        assert!(accept_request(&request, &[]).is_err());

        let mut request = upgrade_request(&[]);
        request.headers.set(UPGRADE, "h2c");
        assert!(accept_request(&request, &[]).is_err());

        let raw = "GET / HTTP/1.1\r\nUpgrade: websocket\r\n\r\n";
        let request = parse_request_blocking(raw);
        assert!(matches!(
            accept_request(&request, &[]),
            Err(Error::Handshake(HandshakeError::MissingHeader(
                SEC_WEBSOCKET_KEY
            )))
        ));
    }

    fn parse_request_blocking(raw: &str) -> RequestHead {
        let raw = raw.as_bytes().to_vec();
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(async move {
                let mut reader = std::io::Cursor::new(raw);
                RequestHead::read(&mut reader).await.unwrap()
            })
    }

    fn answered(status: u16, subprotocol: Option<&str>) -> ResponseHead {
        let mut response = ResponseHead::new(status, "Switching Protocols");
        response.headers.set(
            SEC_WEBSOCKET_ACCEPT,
            accept_digest("dGhlIHNhbXBsZSBub25jZQ=="),
        );
        if let Some(name) = subprotocol {
            response.headers.set(SEC_WEBSOCKET_PROTOCOL, name);
        }
        response
    }

    #[test]
    fn client_validation_accepts_matching_response() {
        let response = answered(101, Some("chat"));
        let negotiated = validate_server_response(
            &response,
            "dGhlIHNhbXBsZSBub25jZQ==",
            &strings(&["chat", "superchat"]),
        )
        .unwrap();
        assert_eq!(negotiated.as_deref(), Some("chat"));
    }

    #[test]
    fn client_validation_rejects_bad_status_and_digest() {
        let response = answered(400, None);
        assert!(validate_server_response(&response, "dGhlIHNhbXBsZSBub25jZQ==", &[]).is_err());

        let mut response = answered(101, None);
        response.headers.set(SEC_WEBSOCKET_ACCEPT, "bogus=");
        assert!(matches!(
            validate_server_response(&response, "dGhlIHNhbXBsZSBub25jZQ==", &[]),
            Err(Error::Handshake(HandshakeError::AcceptMismatch { .. }))
        ));
    }

    #[test]
    fn client_validation_enforces_subprotocol_consistency() {
        // offered some, answered none
        let response = answered(101, None);
        assert!(validate_server_response(
            &response,
            "dGhlIHNhbXBsZSBub25jZQ==",
            &strings(&["chat"])
        )
        .is_err());

        // offered none, answered some
        let response = answered(101, Some("chat"));
        assert!(
            validate_server_response(&response, "dGhlIHNhbXBsZSBub25jZQ==", &[]).is_err()
        );

        // answered something never offered
        let response = answered(101, Some("log"));
        assert!(validate_server_response(
            &response,
            "dGhlIHNhbXBsZSBub25jZQ==",
            &strings(&["chat"])
        )
        .is_err());

        // offered none, answered none
        let response = answered(101, None);
        assert_eq!(
            validate_server_response(&response, "dGhlIHNhbXBsZSBub25jZQ==", &[]).unwrap(),
            None
        );
    }

    #[test]
    fn reject_response_closes_the_connection() {
        let response = reject_response();
        assert_eq!(response.status, 400);
        assert_eq!(response.headers.get(CONNECTION), Some("close"));
    }
}
