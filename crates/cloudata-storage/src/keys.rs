use cloudata_types::KeyspaceId;

/// `data` partition: `keyspace(4) ++ key_bytes`.
/// Big-endian keyspace → keyspace-major, then byte-lexicographic on the key.
pub fn data_key(keyspace: KeyspaceId, key: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + key.len());
    buf.extend_from_slice(&keyspace.0.to_be_bytes());
    buf.extend_from_slice(key);
    buf
}

/// 4-byte prefix shared by every data and oplog key of a keyspace.
pub fn keyspace_prefix(keyspace: KeyspaceId) -> [u8; 4] {
    keyspace.0.to_be_bytes()
}

/// Strip the keyspace prefix from a physical data key.
pub fn user_key(physical: &[u8]) -> &[u8] {
    &physical[4.min(physical.len())..]
}

/// `oplog` partition: `keyspace(4) ++ seq(8)`, fixed 12 bytes, both
/// big-endian so records of one keyspace sort by sequence number.
pub fn oplog_key(keyspace: KeyspaceId, seq: u64) -> [u8; 12] {
    let mut key = [0u8; 12];
    key[..4].copy_from_slice(&keyspace.0.to_be_bytes());
    key[4..].copy_from_slice(&seq.to_be_bytes());
    key
}

/// Sequence number of an oplog key, `None` if the key is malformed.
pub fn oplog_seq(physical: &[u8]) -> Option<u64> {
    let raw: [u8; 8] = physical.get(4..12)?.try_into().ok()?;
    Some(u64::from_be_bytes(raw))
}

/// `registry` partition, forward mapping: `b'n' ++ name_utf8`.
pub fn registry_name_key(name: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + name.len());
    buf.push(b'n');
    buf.extend_from_slice(name.as_bytes());
    buf
}

/// `registry` partition, reverse mapping: `b'i' ++ id(4)`.
pub fn registry_id_key(keyspace: KeyspaceId) -> [u8; 5] {
    let mut key = [0u8; 5];
    key[0] = b'i';
    key[1..].copy_from_slice(&keyspace.0.to_be_bytes());
    key
}

/// Prefix covering every forward-mapping entry.
pub const REGISTRY_NAME_PREFIX: &[u8] = b"n";

/// Prefix covering every reverse-mapping entry, in ID order.
pub const REGISTRY_ID_PREFIX: &[u8] = b"i";

/// `meta` partition: `label_utf8`.
pub fn meta_key(label: &str) -> Vec<u8> {
    label.as_bytes().to_vec()
}
