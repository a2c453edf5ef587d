use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Size of the wire header: one code byte plus a big-endian u32 body
/// length.
pub const FRAME_HEADER_LEN: usize = 5;

/// Wire codes for remote packets. Code 5 is reserved.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum PacketCode {
    ClientHello = 0,
    ServerHello = 1,
    Pause = 2,
    Resume = 3,
    Message = 4,
    Ping = 6,
}

impl PacketCode {
    fn from_u8(code: u8) -> Option<PacketCode> {
        match code {
            0 => Some(PacketCode::ClientHello),
            1 => Some(PacketCode::ServerHello),
            2 => Some(PacketCode::Pause),
            3 => Some(PacketCode::Resume),
            4 => Some(PacketCode::Message),
            6 => Some(PacketCode::Ping),
            _ => None,
        }
    }
}

/// Structural framing errors. "Not enough data yet" is not an error; the
/// decoder reports it as `Ok(None)`.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("unknown packet code {0}")]
    UnknownCode(u8),
    #[error("malformed clientHello body, {0}")]
    MalformedHello(serde_json::Error),
}

/// Identity document sent as the `clientHello` body.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientHello {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub device_info: DeviceInfo,
    pub app_info: AppInfo,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub name: String,
    pub model: String,
    pub localized_model: String,
    pub system_name: String,
    pub system_version: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppInfo {
    pub sdk_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<String>,
}

impl ClientHello {
    /// An identity document for this process, with host facts from the
    /// standard library and the crate version as the SDK version.
    pub fn for_this_process(device_id: Option<String>) -> ClientHello {
        ClientHello {
            device_id,
            device_info: DeviceInfo {
                name: std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_owned()),
                model: std::env::consts::ARCH.to_owned(),
                localized_model: std::env::consts::ARCH.to_owned(),
                system_name: std::env::consts::OS.to_owned(),
                system_version: String::new(),
            },
            app_info: AppInfo {
                sdk_version: env!("CARGO_PKG_VERSION").to_owned(),
                bundle_identifier: None,
                name: std::env::current_exe()
                    .ok()
                    .and_then(|path| path.file_name().map(|n| n.to_string_lossy().into_owned())),
                version: None,
                build: None,
            },
        }
    }
}

/// One remote-protocol packet. `Message` bodies carry a JSON-encoded
/// event; control packets have empty bodies except `clientHello`.
#[derive(Clone, Debug, PartialEq)]
pub enum Packet {
    ClientHello(ClientHello),
    ServerHello,
    Pause,
    Resume,
    Message(Bytes),
    Ping,
}

impl Packet {
    pub fn code(&self) -> PacketCode {
        match self {
            Packet::ClientHello(_) => PacketCode::ClientHello,
            Packet::ServerHello => PacketCode::ServerHello,
            Packet::Pause => PacketCode::Pause,
            Packet::Resume => PacketCode::Resume,
            Packet::Message(_) => PacketCode::Message,
            Packet::Ping => PacketCode::Ping,
        }
    }

    /// Appends the framed packet to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), serde_json::Error> {
        let body: Bytes = match self {
            Packet::ClientHello(hello) => Bytes::from(serde_json::to_vec(hello)?),
            Packet::Message(body) => body.clone(),
            Packet::ServerHello | Packet::Pause | Packet::Resume | Packet::Ping => Bytes::new(),
        };
        buf.put_u8(self.code() as u8);
        buf.put_u32(body.len() as u32);
        buf.put_slice(&body);
        Ok(())
    }

    /// Consumes one full frame from the front of `buf`, if present.
    /// Returns `Ok(None)` when more bytes are needed; nothing is consumed
    /// in that case. A structural problem (unknown code, malformed hello
    /// body) is an error and the caller should drop the connection.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Packet>, FrameError> {
        if buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let body_len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        if buf.len() < FRAME_HEADER_LEN + body_len {
            return Ok(None);
        }

        let code = buf[0];
        buf.advance(FRAME_HEADER_LEN);
        let body = buf.split_to(body_len).freeze();

        let code = PacketCode::from_u8(code).ok_or(FrameError::UnknownCode(code))?;
        let packet = match code {
            PacketCode::ClientHello => Packet::ClientHello(
                serde_json::from_slice(&body).map_err(FrameError::MalformedHello)?,
            ),
            PacketCode::ServerHello => Packet::ServerHello,
            PacketCode::Pause => Packet::Pause,
            PacketCode::Resume => Packet::Resume,
            PacketCode::Message => Packet::Message(body),
            PacketCode::Ping => Packet::Ping,
        };
        Ok(Some(packet))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_for_every_packet_kind() {
        let packets = vec![
            Packet::ClientHello(ClientHello::for_this_process(Some("device-1".to_owned()))),
            Packet::ServerHello,
            Packet::Pause,
            Packet::Resume,
            Packet::Message(Bytes::from_static(br#"{"message":"hi"}"#)),
            Packet::Ping,
        ];

        let mut wire = BytesMut::new();
        for packet in &packets {
            packet.encode(&mut wire).unwrap();
        }

        let mut decoded = Vec::new();
        while let Some(packet) = Packet::decode(&mut wire).unwrap() {
            decoded.push(packet);
        }
        assert_eq!(decoded, packets);
        assert!(wire.is_empty());
    }

    #[test]
    fn partial_frames_consume_nothing() {
        let mut wire = BytesMut::new();
        Packet::Message(Bytes::from_static(b"0123456789"))
            .encode(&mut wire)
            .unwrap();

        // Header alone is not enough.
        let mut partial = BytesMut::from(&wire[..FRAME_HEADER_LEN]);
        assert!(Packet::decode(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), FRAME_HEADER_LEN);

        // Header plus half the body is still not enough.
        let mut partial = BytesMut::from(&wire[..FRAME_HEADER_LEN + 5]);
        assert!(Packet::decode(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), FRAME_HEADER_LEN + 5);
    }

    #[test]
    fn split_delivery_decodes_once_complete() {
        let mut wire = BytesMut::new();
        Packet::Ping.encode(&mut wire).unwrap();
        Packet::Message(Bytes::from_static(b"abc"))
            .encode(&mut wire)
            .unwrap();

        let mut receive = BytesMut::new();
        let mut decoded = Vec::new();
        for byte in wire.iter() {
            receive.put_u8(*byte);
            while let Some(packet) = Packet::decode(&mut receive).unwrap() {
                decoded.push(packet);
            }
        }
        assert_eq!(
            decoded,
            vec![Packet::Ping, Packet::Message(Bytes::from_static(b"abc"))]
        );
    }

    #[test]
    fn unknown_code_is_a_structural_error() {
        let mut wire = BytesMut::new();
        wire.put_u8(9);
        wire.put_u32(0);
        assert!(matches!(
            Packet::decode(&mut wire),
            Err(FrameError::UnknownCode(9))
        ));
    }

    #[test]
    fn client_hello_uses_camel_case_keys() {
        let hello = ClientHello {
            device_id: Some("d".to_owned()),
            device_info: DeviceInfo {
                name: "host".to_owned(),
                model: "x86_64".to_owned(),
                localized_model: "x86_64".to_owned(),
                system_name: "linux".to_owned(),
                system_version: "6.1".to_owned(),
            },
            app_info: AppInfo {
                sdk_version: "1.2.3".to_owned(),
                bundle_identifier: Some("com.example.app".to_owned()),
                name: None,
                version: None,
                build: None,
            },
        };
        let json = serde_json::to_value(&hello).unwrap();
        assert_eq!(json["deviceId"], "d");
        assert_eq!(json["deviceInfo"]["localizedModel"], "x86_64");
        assert_eq!(json["deviceInfo"]["systemName"], "linux");
        assert_eq!(json["appInfo"]["sdkVersion"], "1.2.3");
        assert_eq!(json["appInfo"]["bundleIdentifier"], "com.example.app");
    }
}
