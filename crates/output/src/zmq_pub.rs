// Copyright 2025-2026 CEMAXECUTER LLC

use std::fs;

use crate::{EventChannel, IntegrationFrame};

/// ZMQ publisher for streaming integration frames to the consumer.
/// Provider PUB socket connects out; consumer SUB socket binds.
///
/// Each frame is one multipart message:
/// `[event] [namespace] [JSON header] [bins as LE i16]`.
pub struct ZmqPublisher {
    socket: zmq::Socket,
    namespace: String,
    _ctx: zmq::Context,
}

impl ZmqPublisher {
    /// Create a new ZMQ PUB socket and connect to the given endpoint.
    /// `curve_keyfile`: path to keyfile with public_key= and secret_key= lines.
    pub fn new(
        endpoint: &str,
        namespace: &str,
        curve_keyfile: Option<&str>,
    ) -> Result<Self, String> {
        let ctx = zmq::Context::new();
        let socket = ctx
            .socket(zmq::PUB)
            .map_err(|e| format!("zmq PUB socket: {}", e))?;

        socket
            .set_sndhwm(1000)
            .map_err(|e| format!("zmq set_sndhwm: {}", e))?;

        if let Some(keyfile) = curve_keyfile {
            let (public_key, secret_key) = parse_curve_keyfile(keyfile)?;
            socket
                .set_curve_server(true)
                .map_err(|e| format!("zmq curve_server: {}", e))?;
            socket
                .set_curve_secretkey(secret_key.as_bytes())
                .map_err(|e| format!("zmq curve_secretkey: {}", e))?;
            socket
                .set_curve_publickey(public_key.as_bytes())
                .map_err(|e| format!("zmq curve_publickey: {}", e))?;
            log::info!(
                "ZMQ CURVE: encrypted (server key: {}...)",
                &public_key[..8.min(public_key.len())]
            );
        }

        socket
            .connect(endpoint)
            .map_err(|e| format!("zmq connect to {}: {}", endpoint, e))?;

        log::info!("ZMQ PUB: connected to {} (namespace {})", endpoint, namespace);

        Ok(Self {
            socket,
            namespace: namespace.to_string(),
            _ctx: ctx,
        })
    }
}

impl EventChannel for ZmqPublisher {
    fn emit(&mut self, event: &str, frame: &IntegrationFrame) -> Result<(), String> {
        let header = frame.header_json()?;
        let parts: [&[u8]; 3] = [event.as_bytes(), self.namespace.as_bytes(), header.as_bytes()];
        for part in parts {
            self.socket
                .send(part, zmq::DONTWAIT | zmq::SNDMORE)
                .map_err(|e| format!("zmq send {}: {}", event, e))?;
        }
        self.socket
            .send(frame.bins_le_bytes(), zmq::DONTWAIT)
            .map_err(|e| format!("zmq send {}: {}", event, e))
    }
}

/// Parse a CurveZMQ keyfile (public_key=... and secret_key=... lines).
pub fn parse_curve_keyfile(path: &str) -> Result<(String, String), String> {
    let content = fs::read_to_string(path)
        .map_err(|e| format!("failed to read curve keyfile {}: {}", path, e))?;

    let mut public_key = None;
    let mut secret_key = None;

    for line in content.lines() {
        let line = line.trim();
        if line.starts_with('#') || line.is_empty() {
            continue;
        }
        if let Some(key) = line.strip_prefix("public_key=") {
            if key.len() >= 40 {
                public_key = Some(key[..40].to_string());
            }
        } else if let Some(key) = line.strip_prefix("secret_key=") {
            if key.len() >= 40 {
                secret_key = Some(key[..40].to_string());
            }
        }
    }

    match (public_key, secret_key) {
        (Some(pub_k), Some(sec_k)) => Ok((pub_k, sec_k)),
        _ => Err(format!("failed to parse curve keys from {}", path)),
    }
}
