use bytes::Bytes;

/// Opaque view of a stream cipher attached to one direction of a session.
///
/// The cipher engine itself lives outside this crate; the protocol layer
/// only needs the key material for one-time-auth digests and the `ota`
/// policy flag. Never mutated here.
#[derive(Debug, Clone)]
pub struct CipherView {
    pub iv: Bytes,
    pub key: Bytes,
    pub ota: bool,
}

impl CipherView {
    pub fn new(iv: impl Into<Bytes>, key: impl Into<Bytes>, ota: bool) -> Self {
        Self {
            iv: iv.into(),
            key: key.into(),
            ota,
        }
    }
}
