//! Versioned binary codec with conditional LZ4 compression.
//!
//! Wire format of one encoded message:
//!
//! ```text
//! +--------------+-------------------------------------------+
//! | flag (1 byte)| body                                      |
//! |  0x00 / 0x01 | [version u8][postcard Message]            |
//! |              | (lz4 size-prepended when flag is 0x01)    |
//! +--------------+-------------------------------------------+
//! ```
//!
//! Small messages skip compression; snapshot chunks, which repeat model
//! names and slot names, usually cross the threshold.

use lz4_flex::{compress_prepend_size, decompress_size_prepended};

use crate::messages::Message;

/// Current wire-protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Compression flag: payload is uncompressed.
pub const COMPRESSION_FLAG_NONE: u8 = 0x00;

/// Compression flag: payload is LZ4-compressed.
pub const COMPRESSION_FLAG_LZ4: u8 = 0x01;

/// Controls when payloads are compressed.
#[derive(Debug, Clone)]
pub struct CodecConfig {
    /// Minimum serialized size (bytes) before compression is applied. Default: 256.
    pub threshold: usize,
    /// Whether compression is enabled at all. Default: true.
    pub enabled: bool,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            threshold: 256,
            enabled: true,
        }
    }
}

impl From<&nebula_config::NetworkConfig> for CodecConfig {
    fn from(config: &nebula_config::NetworkConfig) -> Self {
        Self {
            threshold: config.compression_threshold,
            enabled: config.compression_enabled,
        }
    }
}

/// Errors that can occur while encoding or decoding a message.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The payload was empty.
    #[error("empty payload")]
    EmptyPayload,

    /// The version byte does not match [`PROTOCOL_VERSION`].
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// An unknown compression flag byte was encountered.
    #[error("unknown compression flag: 0x{0:02X}")]
    UnknownFlag(u8),

    /// LZ4 decompression failed.
    #[error("LZ4 decompression failed: {0}")]
    DecompressFailed(String),

    /// Postcard (de)serialization failed.
    #[error("postcard error: {0}")]
    Postcard(#[from] postcard::Error),
}

/// Encode a [`Message`] into a framed, possibly compressed payload.
pub fn encode(msg: &Message, config: &CodecConfig) -> Result<Vec<u8>, CodecError> {
    let body = postcard::to_allocvec(msg)?;
    let mut versioned = Vec::with_capacity(1 + body.len());
    versioned.push(PROTOCOL_VERSION);
    versioned.extend_from_slice(&body);

    if !config.enabled || versioned.len() < config.threshold {
        let mut out = Vec::with_capacity(1 + versioned.len());
        out.push(COMPRESSION_FLAG_NONE);
        out.extend_from_slice(&versioned);
        Ok(out)
    } else {
        let compressed = compress_prepend_size(&versioned);
        let mut out = Vec::with_capacity(1 + compressed.len());
        out.push(COMPRESSION_FLAG_LZ4);
        out.extend_from_slice(&compressed);
        Ok(out)
    }
}

/// Decode a payload produced by [`encode`].
pub fn decode(data: &[u8]) -> Result<Message, CodecError> {
    let (&flag, rest) = data.split_first().ok_or(CodecError::EmptyPayload)?;

    let versioned = match flag {
        COMPRESSION_FLAG_NONE => rest.to_vec(),
        COMPRESSION_FLAG_LZ4 => decompress_size_prepended(rest)
            .map_err(|e| CodecError::DecompressFailed(e.to_string()))?,
        other => return Err(CodecError::UnknownFlag(other)),
    };

    let (&version, body) = versioned.split_first().ok_or(CodecError::EmptyPayload)?;
    if version != PROTOCOL_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }

    Ok(postcard::from_bytes(body)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::*;
    use glam::Vec3;

    fn state(id: u64) -> ActorState {
        ActorState {
            actor_id: ActorId(id),
            status: ActorStatus::Active,
            activated: true,
            persistent: false,
            spawn_pose: Pose::at(Vec3::new(1.0, 0.0, 2.0)),
            pose: Pose::at(Vec3::new(3.0, 0.0, 4.0)),
            pose_time: 12.5,
            health: Health::full(100.0),
            equipment: [("Helmet".to_string(), 41), ("Armor".to_string(), 42)].into(),
            weapons: [("PrimaryWeapon".to_string(), 7)].into(),
            buffs: vec![BuffRecord {
                weapon_type: 7,
                buff_id: 3,
            }],
            model_name: "scav_grunt".to_string(),
            preset_name: "grunt_default".to_string(),
            scene: SceneRef {
                index: 2,
                path: "Levels/Factory".to_string(),
            },
        }
    }

    #[test]
    fn test_state_update_roundtrip_uncompressed() {
        let msg = Message::StateUpdate(StateUpdate {
            actor_id: ActorId(9),
            remote_time: 3.25,
            pose: Pose::at(Vec3::new(-4.0, 1.5, 8.0)),
            health: Health::full(80.0),
            anim: AnimSample {
                move_speed: 0.5,
                ..AnimSample::default()
            },
        });
        let bytes = encode(&msg, &CodecConfig::default()).unwrap();
        assert_eq!(bytes[0], COMPRESSION_FLAG_NONE);
        assert_eq!(bytes[1], PROTOCOL_VERSION);
        assert_eq!(decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_large_snapshot_chunk_is_compressed() {
        let msg = Message::SnapshotChunk(SnapshotChunk {
            stream_id: 1,
            index: 0,
            last: true,
            reset: true,
            entries: (0..16).map(state).collect(),
        });
        let bytes = encode(&msg, &CodecConfig::default()).unwrap();
        assert_eq!(bytes[0], COMPRESSION_FLAG_LZ4);
        assert_eq!(decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_compression_can_be_disabled() {
        let config = CodecConfig {
            enabled: false,
            ..CodecConfig::default()
        };
        let msg = Message::Spawn(Spawn { state: state(1) });
        let bytes = encode(&msg, &config).unwrap();
        assert_eq!(bytes[0], COMPRESSION_FLAG_NONE);
    }

    #[test]
    fn test_empty_payload_rejected() {
        assert!(matches!(decode(&[]), Err(CodecError::EmptyPayload)));
        assert!(matches!(
            decode(&[COMPRESSION_FLAG_NONE]),
            Err(CodecError::EmptyPayload)
        ));
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let msg = Message::ActivationRequest(ActivationRequest {
            actor_id: ActorId(1),
        });
        let mut bytes = encode(&msg, &CodecConfig::default()).unwrap();
        bytes[1] = 255;
        assert!(matches!(
            decode(&bytes),
            Err(CodecError::UnsupportedVersion(255))
        ));
    }

    #[test]
    fn test_unknown_flag_rejected() {
        assert!(matches!(
            decode(&[0x7F, PROTOCOL_VERSION]),
            Err(CodecError::UnknownFlag(0x7F))
        ));
    }

    #[test]
    fn test_corrupted_body_rejected() {
        let result = decode(&[COMPRESSION_FLAG_NONE, PROTOCOL_VERSION, 0xFF, 0xFF, 0xFF]);
        assert!(result.is_err());
    }

    #[test]
    fn test_corrupted_lz4_rejected() {
        let result = decode(&[COMPRESSION_FLAG_LZ4, 16, 0, 0, 0, 0xFF]);
        assert!(matches!(result, Err(CodecError::DecompressFailed(_))));
    }
}
