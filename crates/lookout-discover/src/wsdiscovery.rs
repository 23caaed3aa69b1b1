//! WS-Discovery probe construction and ProbeMatches parsing.
//!
//! Only the two messages the gateway needs are handled: an outgoing
//! `Probe` and the `ProbeMatches` replies it solicits. Replies are read
//! with the `quick-xml` pull reader and matched on local element names,
//! so any namespace prefix a camera vendor picks is accepted.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Url;
use serde::Serialize;
use uuid::Uuid;

use lookout_core::IdentityToken;

use crate::error::{DiscoverError, Result};

/// Well-known WS-Discovery UDP port.
pub const DISCOVERY_PORT: u16 = 3702;

/// WS-Discovery IPv4 multicast group.
pub const MULTICAST_GROUP: SocketAddrV4 =
    SocketAddrV4::new(Ipv4Addr::new(239, 255, 255, 250), DISCOVERY_PORT);

/// Namespace of the ONVIF network service types.
pub const ONVIF_NETWORK_NS: &str = "http://www.onvif.org/ver10/network/wsdl";

/// Probe type matching ONVIF cameras and encoders.
pub const ONVIF_DEVICE_TYPE: &str = "dn:NetworkVideoTransmitter";

const NS_SOAP_ENV: &str = "http://www.w3.org/2003/05/soap-envelope";
const NS_ADDRESSING: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing";
const NS_DISCOVERY: &str = "http://schemas.xmlsoap.org/ws/2005/04/discovery";
const ACTION_PROBE: &str = "http://schemas.xmlsoap.org/ws/2005/04/discovery/Probe";
const ADDRESS_ANONYMOUS: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous";
const TO_DISCOVERY: &str = "urn:schemas-xmlsoap-org:ws:2005:04:discovery";

/// Build a `Probe` message tagged with `message_id`.
///
/// `types` and `scopes` become the `d:Types` and `d:Scopes` filters and
/// are omitted when empty. `namespaces` adds `xmlns:<prefix>` declarations
/// to the envelope for prefixes used inside `types`.
pub fn build_probe(
    message_id: Uuid,
    types: &[&str],
    scopes: &[&str],
    namespaces: &[(&str, &str)],
) -> String {
    let mut extra_ns = String::new();
    for (prefix, uri) in namespaces {
        extra_ns.push_str(&format!(" xmlns:{}=\"{}\"", escape(*prefix), escape(*uri)));
    }

    let mut body = String::new();
    if !types.is_empty() {
        body.push_str(&format!("<d:Types>{}</d:Types>", escape(types.join(" ").as_str())));
    }
    if !scopes.is_empty() {
        body.push_str(&format!("<d:Scopes>{}</d:Scopes>", escape(scopes.join(" ").as_str())));
    }

    format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            r#"<soap-env:Envelope xmlns:soap-env="{soap}" xmlns:a="{wsa}" xmlns:d="{wsd}"{extra}>"#,
            r#"<soap-env:Header>"#,
            r#"<a:Action soap-env:mustUnderstand="1">{action}</a:Action>"#,
            r#"<a:MessageID>uuid:{id}</a:MessageID>"#,
            r#"<a:ReplyTo><a:Address>{anon}</a:Address></a:ReplyTo>"#,
            r#"<a:To soap-env:mustUnderstand="1">{to}</a:To>"#,
            r#"</soap-env:Header>"#,
            r#"<soap-env:Body><d:Probe>{body}</d:Probe></soap-env:Body>"#,
            r#"</soap-env:Envelope>"#,
        ),
        soap = NS_SOAP_ENV,
        wsa = NS_ADDRESSING,
        wsd = NS_DISCOVERY,
        extra = extra_ns,
        action = ACTION_PROBE,
        id = message_id,
        anon = ADDRESS_ANONYMOUS,
        to = TO_DISCOVERY,
        body = body,
    )
}

/// The probe the gateway sends: ONVIF network video transmitters only.
pub fn onvif_probe(message_id: Uuid) -> String {
    build_probe(
        message_id,
        &[ONVIF_DEVICE_TYPE],
        &[],
        &[("dn", ONVIF_NETWORK_NS)],
    )
}

/// One endpoint described by a `ProbeMatch`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EndpointDescriptor {
    /// `EndpointReference/Address`, absent if the responder left it out.
    pub identity: Option<IdentityToken>,
    /// Service URLs, in the order advertised.
    pub xaddrs: Vec<String>,
    pub types: Vec<String>,
    pub scopes: Vec<String>,
    pub metadata_version: Option<u32>,
    /// `MessageID` of the probe this reply answers.
    pub relates_to: Option<String>,
    /// Socket address the reply arrived from, when known.
    pub responder: Option<SocketAddr>,
}

impl EndpointDescriptor {
    /// Host and port of the first XAddr; the port defaults to the
    /// scheme's well-known port (80 for plain HTTP).
    pub fn device_address(&self) -> Option<(String, u16)> {
        self.xaddrs.iter().find_map(|xaddr| {
            let url = Url::parse(xaddr).ok()?;
            let host = url.host_str()?.to_string();
            let port = url.port_or_known_default().unwrap_or(80);
            Some((host, port))
        })
    }

    /// Host to report when the descriptor has no usable XAddr.
    pub fn fallback_host(&self) -> Option<String> {
        self.responder.map(|addr| addr.ip().to_string())
    }

    /// Decoded value of an ONVIF scope, e.g. `scope_value("name")` for
    /// `onvif://www.onvif.org/name/Front%20Door`.
    pub fn scope_value(&self, key: &str) -> Option<String> {
        let prefix = format!("onvif://www.onvif.org/{key}/");
        self.scopes
            .iter()
            .find_map(|scope| scope.strip_prefix(&prefix))
            .map(percent_decode)
    }
}

/// Parse a batch of raw replies.
///
/// Each payload stands alone: a malformed one is logged and skipped and
/// the rest still parse.
pub fn parse_responses<P: AsRef<[u8]>>(payloads: &[P]) -> Vec<EndpointDescriptor> {
    let mut endpoints = Vec::new();
    for (index, payload) in payloads.iter().enumerate() {
        match parse_response(payload.as_ref()) {
            Ok(found) => endpoints.extend(found),
            Err(e) => {
                tracing::warn!(
                    payload_index = index,
                    payload_len = payload.as_ref().len(),
                    error = %e,
                    "Skipping malformed WS-Discovery response"
                );
            }
        }
    }
    endpoints
}

/// Parse one reply into zero or more endpoints.
pub fn parse_response(payload: &[u8]) -> Result<Vec<EndpointDescriptor>> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| DiscoverError::ProtocolParse(format!("payload is not UTF-8: {e}")))?;

    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut path: Vec<String> = Vec::new();
    let mut text_buf = String::new();
    let mut relates_to: Option<String> = None;
    let mut current: Option<EndpointDescriptor> = None;
    let mut matches: Vec<EndpointDescriptor> = Vec::new();
    let mut saw_envelope = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = local_name(e.local_name().as_ref());
                if path.is_empty() {
                    if name != "Envelope" {
                        return Err(DiscoverError::ProtocolParse(format!(
                            "expected SOAP Envelope, found <{name}>"
                        )));
                    }
                    saw_envelope = true;
                }
                if name == "ProbeMatch" {
                    current = Some(EndpointDescriptor::default());
                }
                path.push(name);
                text_buf.clear();
            }
            Ok(Event::Empty(e)) => {
                let name = local_name(e.local_name().as_ref());
                if path.is_empty() {
                    return Err(DiscoverError::ProtocolParse(format!(
                        "expected SOAP Envelope, found <{name}/>"
                    )));
                }
            }
            Ok(Event::Text(t)) => {
                let unescaped = t
                    .unescape()
                    .map_err(|e| DiscoverError::ProtocolParse(e.to_string()))?;
                text_buf.push_str(&unescaped);
            }
            Ok(Event::CData(c)) => {
                text_buf.push_str(&String::from_utf8_lossy(&c.into_inner()));
            }
            Ok(Event::End(_)) => {
                let Some(name) = path.pop() else {
                    return Err(DiscoverError::ProtocolParse(
                        "unbalanced closing tag".to_string(),
                    ));
                };
                let value = text_buf.trim().to_string();
                text_buf.clear();

                if name == "RelatesTo" && path.last().map(String::as_str) == Some("Header") {
                    relates_to = Some(value);
                } else if name == "ProbeMatch" {
                    if let Some(done) = current.take() {
                        matches.push(done);
                    }
                } else if let Some(endpoint) = current.as_mut() {
                    apply_field(endpoint, &name, path.last().map(String::as_str), value);
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(DiscoverError::ProtocolParse(format!(
                    "at byte {}: {e}",
                    reader.error_position()
                )))
            }
        }
    }

    if !saw_envelope {
        return Err(DiscoverError::ProtocolParse("empty document".to_string()));
    }
    if !path.is_empty() {
        return Err(DiscoverError::ProtocolParse(format!(
            "truncated document, <{}> never closed",
            path.join("/")
        )));
    }

    for endpoint in &mut matches {
        endpoint.relates_to = relates_to.clone();
    }
    Ok(matches)
}

fn apply_field(endpoint: &mut EndpointDescriptor, name: &str, parent: Option<&str>, value: String) {
    match (name, parent) {
        ("Address", Some("EndpointReference")) => {
            endpoint.identity = IdentityToken::new(value).ok();
        }
        ("Types", _) => endpoint.types = split_list(&value),
        ("Scopes", _) => endpoint.scopes = split_list(&value),
        ("XAddrs", _) => endpoint.xaddrs = split_list(&value),
        ("MetadataVersion", _) => endpoint.metadata_version = value.parse().ok(),
        _ => {}
    }
}

fn local_name(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
}

fn split_list(value: &str) -> Vec<String> {
    value.split_whitespace().map(str::to_string).collect()
}

fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
