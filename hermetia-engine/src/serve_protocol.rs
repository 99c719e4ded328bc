// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! The `serve` wire protocol for remote workers.
//!
//! Framed over a byte stream (historically an SSH stdin/stdout pair):
//! every integer is 64-bit little-endian, strings are length-prefixed and
//! zero-padded to 8 bytes. The handshake exchanges magic values and a
//! 2-byte major/minor version; features are gated by the negotiated
//! minor:
//!
//! - ≥2: `max_log_size` in build options
//! - ≥3: `times_built`, `is_non_deterministic`, `start_time`, `stop_time`
//!   on build results
//! - ≥4: NAR hash, CA descriptor, and signatures in path info
//! - ≥6: the legacy built-outputs map (superseded)
//! - ≥7: `keep_failed` in build options (silently dropped below)
//! - ≥8: realisations keyed by output name
//!
//! Build statuses transit as a flat integer; the receiver picks the
//! success or failure variant by range check so the enum can grow.

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use hermetia_store_core::content_address::ContentAddress;
use hermetia_store_core::hash::Hash;
use hermetia_store_core::store_path::{StoreDir, StorePath};

use crate::build_result::{BuildResult, BuildStatus, Realisation};
use crate::error::BuildError;

pub const SERVE_MAGIC_1: u64 = 0x390c9deb;
pub const SERVE_MAGIC_2: u64 = 0x5452eecb;

/// The protocol version this engine speaks.
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion::new(2, 8);

/// Commands sent by the client after the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum Command {
    QueryValidPaths = 1,
    QueryPathInfos = 2,
    DumpStorePath = 3,
    ImportPaths = 4,
    ExportPaths = 5,
    BuildPaths = 6,
    QueryClosure = 7,
    BuildDerivation = 8,
    AddToStoreNar = 9,
}

impl Command {
    pub fn from_code(code: u64) -> Option<Self> {
        use Command::*;
        Some(match code {
            1 => QueryValidPaths,
            2 => QueryPathInfos,
            3 => DumpStorePath,
            4 => ImportPaths,
            5 => ExportPaths,
            6 => BuildPaths,
            7 => QueryClosure,
            8 => BuildDerivation,
            9 => AddToStoreNar,
            _ => return None,
        })
    }
}

/// A 2-byte major/minor protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProtocolVersion(u16);

impl ProtocolVersion {
    pub const fn new(major: u8, minor: u8) -> Self {
        ProtocolVersion(((major as u16) << 8) | minor as u16)
    }

    pub fn major(&self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn minor(&self) -> u8 {
        (self.0 & 0xff) as u8
    }

    pub fn raw(&self) -> u16 {
        self.0
    }

    pub fn from_raw(raw: u16) -> Self {
        ProtocolVersion(raw)
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major(), self.minor())
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad magic: expected {expected:#x}, got {got:#x}")]
    BadMagic { expected: u64, got: u64 },

    #[error("unsupported protocol major version {0}")]
    UnsupportedVersion(ProtocolVersion),

    #[error("malformed message: {0}")]
    Malformed(String),
}

/// Build options transmitted with a `BuildDerivation` command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WireBuildOptions {
    pub max_silent_time: Option<Duration>,
    pub build_timeout: Option<Duration>,
    pub max_log_size: u64,
    pub nr_repeats: u32,
    pub keep_failed: bool,
}

// ---------------------------------------------------------------------------
// Primitives
// ---------------------------------------------------------------------------

pub async fn write_u64(w: &mut (impl AsyncWrite + Unpin), value: u64) -> Result<(), ProtocolError> {
    w.write_all(&value.to_le_bytes()).await?;
    Ok(())
}

pub async fn read_u64(r: &mut (impl AsyncRead + Unpin)) -> Result<u64, ProtocolError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf).await?;
    Ok(u64::from_le_bytes(buf))
}

pub async fn write_bool(w: &mut (impl AsyncWrite + Unpin), value: bool) -> Result<(), ProtocolError> {
    write_u64(w, value as u64).await
}

pub async fn read_bool(r: &mut (impl AsyncRead + Unpin)) -> Result<bool, ProtocolError> {
    Ok(read_u64(r).await? != 0)
}

pub async fn write_string(
    w: &mut (impl AsyncWrite + Unpin),
    value: &str,
) -> Result<(), ProtocolError> {
    let bytes = value.as_bytes();
    write_u64(w, bytes.len() as u64).await?;
    w.write_all(bytes).await?;
    let rem = bytes.len() % 8;
    if rem != 0 {
        w.write_all(&[0u8; 8][..8 - rem]).await?;
    }
    Ok(())
}

pub async fn read_string(r: &mut (impl AsyncRead + Unpin)) -> Result<String, ProtocolError> {
    let len = read_u64(r).await?;
    if len > 1 << 26 {
        return Err(ProtocolError::Malformed(format!(
            "implausible string length {len}"
        )));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).await?;
    let rem = (len % 8) as usize;
    if rem != 0 {
        let mut pad = [0u8; 8];
        r.read_exact(&mut pad[..8 - rem]).await?;
    }
    String::from_utf8(buf).map_err(|e| ProtocolError::Malformed(format!("non-UTF-8 string: {e}")))
}

pub async fn write_strings(
    w: &mut (impl AsyncWrite + Unpin),
    values: impl ExactSizeIterator<Item = impl AsRef<str>>,
) -> Result<(), ProtocolError> {
    write_u64(w, values.len() as u64).await?;
    for value in values {
        write_string(w, value.as_ref()).await?;
    }
    Ok(())
}

pub async fn read_strings(r: &mut (impl AsyncRead + Unpin)) -> Result<Vec<String>, ProtocolError> {
    let count = read_u64(r).await?;
    if count > 1 << 20 {
        return Err(ProtocolError::Malformed(format!(
            "implausible list length {count}"
        )));
    }
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        out.push(read_string(r).await?);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// Client side of the handshake: send magic, receive magic and the
/// remote's version, agree on the minimum.
pub async fn handshake_client(
    r: &mut (impl AsyncRead + Unpin),
    w: &mut (impl AsyncWrite + Unpin),
) -> Result<ProtocolVersion, ProtocolError> {
    write_u64(w, SERVE_MAGIC_1).await?;
    write_u64(w, PROTOCOL_VERSION.raw() as u64).await?;
    w.flush().await?;

    let magic = read_u64(r).await?;
    if magic != SERVE_MAGIC_2 {
        return Err(ProtocolError::BadMagic {
            expected: SERVE_MAGIC_2,
            got: magic,
        });
    }
    let remote = ProtocolVersion::from_raw(read_u64(r).await? as u16);
    negotiate(remote)
}

/// Server side of the handshake.
pub async fn handshake_server(
    r: &mut (impl AsyncRead + Unpin),
    w: &mut (impl AsyncWrite + Unpin),
) -> Result<ProtocolVersion, ProtocolError> {
    let magic = read_u64(r).await?;
    if magic != SERVE_MAGIC_1 {
        return Err(ProtocolError::BadMagic {
            expected: SERVE_MAGIC_1,
            got: magic,
        });
    }
    let remote = ProtocolVersion::from_raw(read_u64(r).await? as u16);

    write_u64(w, SERVE_MAGIC_2).await?;
    write_u64(w, PROTOCOL_VERSION.raw() as u64).await?;
    w.flush().await?;
    negotiate(remote)
}

fn negotiate(remote: ProtocolVersion) -> Result<ProtocolVersion, ProtocolError> {
    if remote.major() != PROTOCOL_VERSION.major() {
        return Err(ProtocolError::UnsupportedVersion(remote));
    }
    Ok(remote.min(PROTOCOL_VERSION))
}

// ---------------------------------------------------------------------------
// Build options
// ---------------------------------------------------------------------------

pub async fn write_build_options(
    w: &mut (impl AsyncWrite + Unpin),
    version: ProtocolVersion,
    options: &WireBuildOptions,
) -> Result<(), ProtocolError> {
    write_u64(w, options.max_silent_time.map_or(0, |d| d.as_secs())).await?;
    write_u64(w, options.build_timeout.map_or(0, |d| d.as_secs())).await?;
    if version.minor() >= 2 {
        write_u64(w, options.max_log_size).await?;
    }
    if version.minor() >= 3 {
        write_u64(w, options.nr_repeats as u64).await?;
        // enforce-determinism accompanies the repeat count.
        write_bool(w, options.nr_repeats > 0).await?;
    }
    if version.minor() >= 7 {
        write_bool(w, options.keep_failed).await?;
    }
    // Below minor 7 the flag is best-effort and silently dropped.
    Ok(())
}

pub async fn read_build_options(
    r: &mut (impl AsyncRead + Unpin),
    version: ProtocolVersion,
) -> Result<WireBuildOptions, ProtocolError> {
    let max_silent = read_u64(r).await?;
    let timeout = read_u64(r).await?;
    let mut options = WireBuildOptions {
        max_silent_time: (max_silent > 0).then(|| Duration::from_secs(max_silent)),
        build_timeout: (timeout > 0).then(|| Duration::from_secs(timeout)),
        ..Default::default()
    };
    if version.minor() >= 2 {
        options.max_log_size = read_u64(r).await?;
    }
    if version.minor() >= 3 {
        options.nr_repeats = read_u64(r).await? as u32;
        let _enforce_determinism = read_bool(r).await?;
    }
    if version.minor() >= 7 {
        options.keep_failed = read_bool(r).await?;
    }
    Ok(options)
}

// ---------------------------------------------------------------------------
// Build results
// ---------------------------------------------------------------------------

pub async fn write_build_result(
    w: &mut (impl AsyncWrite + Unpin),
    version: ProtocolVersion,
    result: &BuildResult,
) -> Result<(), ProtocolError> {
    write_u64(w, result.status as u64).await?;
    let error_msg = result
        .error
        .as_ref()
        .map(|e| e.to_string())
        .unwrap_or_default();
    write_string(w, &error_msg).await?;

    if version.minor() >= 3 {
        write_u64(w, result.times_built as u64).await?;
        write_bool(w, result.is_non_deterministic).await?;
        write_u64(w, result.start_time).await?;
        write_u64(w, result.stop_time).await?;
    }
    if version.minor() >= 8 {
        write_u64(w, result.built_outputs.len() as u64).await?;
        for (name, realisation) in &result.built_outputs {
            write_string(w, name.as_str()).await?;
            write_string(w, &realisation.out_path.to_string()).await?;
        }
    } else if version.minor() >= 6 {
        // The legacy keyed map is no longer populated.
        write_u64(w, 0).await?;
    }
    Ok(())
}

pub async fn read_build_result(
    r: &mut (impl AsyncRead + Unpin),
    version: ProtocolVersion,
) -> Result<BuildResult, ProtocolError> {
    let raw_status = read_u64(r).await?;
    let error_msg = read_string(r).await?;

    let status = BuildStatus::from_code(raw_status as u16)
        .ok_or_else(|| ProtocolError::Malformed(format!("unknown build status {raw_status}")))?;

    let mut result = if BuildStatus::code_is_success(raw_status as u16) {
        BuildResult::success(status, BTreeMap::new())
    } else {
        let mut failure = BuildResult::failure(BuildError::Misc(error_msg));
        failure.status = status;
        failure
    };

    if version.minor() >= 3 {
        result.times_built = read_u64(r).await? as u32;
        result.is_non_deterministic = read_bool(r).await?;
        result.start_time = read_u64(r).await?;
        result.stop_time = read_u64(r).await?;
    }
    if version.minor() >= 8 {
        let count = read_u64(r).await?;
        for _ in 0..count {
            let name = read_string(r).await?;
            let out_path = read_string(r).await?;
            let name = name
                .parse()
                .map_err(|e| ProtocolError::Malformed(format!("bad output name: {e}")))?;
            let out_path: StorePath = out_path
                .parse()
                .map_err(|e| ProtocolError::Malformed(format!("bad output path: {e}")))?;
            result
                .built_outputs
                .insert(name, Realisation::unsigned(out_path));
        }
    } else if version.minor() >= 6 {
        let count = read_u64(r).await?;
        for _ in 0..count {
            let _key = read_string(r).await?;
            let _value = read_string(r).await?;
        }
    }
    Ok(result)
}

// ---------------------------------------------------------------------------
// Path info
// ---------------------------------------------------------------------------

/// Path metadata as transmitted by `QueryPathInfos`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WirePathInfo {
    pub deriver: Option<StorePath>,
    pub references: Vec<StorePath>,
    pub download_size: u64,
    pub nar_size: u64,
    /// Only transmitted at minor ≥ 4.
    pub nar_hash: Option<Hash>,
    pub ca: Option<ContentAddress>,
    pub sigs: Vec<String>,
}

pub async fn write_path_info(
    w: &mut (impl AsyncWrite + Unpin),
    version: ProtocolVersion,
    store_dir: &StoreDir,
    info: &WirePathInfo,
) -> Result<(), ProtocolError> {
    let deriver = info
        .deriver
        .as_ref()
        .map(|d| store_dir.display_path(d))
        .unwrap_or_default();
    write_string(w, &deriver).await?;
    write_strings(w, info.references.iter().map(|p| store_dir.display_path(p))).await?;
    write_u64(w, info.download_size).await?;
    write_u64(w, info.nar_size).await?;
    if version.minor() >= 4 {
        let nar_hash = info
            .nar_hash
            .as_ref()
            .map(|h| h.format_base32())
            .unwrap_or_default();
        write_string(w, &nar_hash).await?;
        let ca = info.ca.as_ref().map(|c| c.to_string()).unwrap_or_default();
        write_string(w, &ca).await?;
        write_strings(w, info.sigs.iter()).await?;
    }
    Ok(())
}

pub async fn read_path_info(
    r: &mut (impl AsyncRead + Unpin),
    version: ProtocolVersion,
    store_dir: &StoreDir,
) -> Result<WirePathInfo, ProtocolError> {
    let deriver = read_string(r).await?;
    let deriver = if deriver.is_empty() {
        None
    } else {
        Some(
            store_dir
                .parse_path(&deriver)
                .map_err(|e| ProtocolError::Malformed(format!("bad deriver: {e}")))?,
        )
    };
    let references = read_strings(r)
        .await?
        .into_iter()
        .map(|p| store_dir.parse_path(&p))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProtocolError::Malformed(format!("bad reference: {e}")))?;
    let download_size = read_u64(r).await?;
    let nar_size = read_u64(r).await?;

    let mut info = WirePathInfo {
        deriver,
        references,
        download_size,
        nar_size,
        nar_hash: None,
        ca: None,
        sigs: Vec::new(),
    };
    if version.minor() >= 4 {
        let nar_hash = read_string(r).await?;
        if !nar_hash.is_empty() {
            info.nar_hash = Some(
                Hash::parse(&nar_hash)
                    .map_err(|e| ProtocolError::Malformed(format!("bad NAR hash: {e}")))?,
            );
        }
        let ca = read_string(r).await?;
        if !ca.is_empty() {
            info.ca = Some(
                ContentAddress::parse(&ca)
                    .map_err(|e| ProtocolError::Malformed(format!("bad CA: {e}")))?,
            );
        }
        info.sigs = read_strings(r).await?;
    }
    Ok(info)
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Ask a remote worker to build one derivation. The derivation is
/// transmitted in its canonical text form.
pub async fn build_derivation(
    r: &mut (impl AsyncRead + Unpin),
    w: &mut (impl AsyncWrite + Unpin),
    version: ProtocolVersion,
    store_dir: &StoreDir,
    drv_path: &StorePath,
    drv_text: &str,
    options: &WireBuildOptions,
) -> Result<BuildResult, ProtocolError> {
    write_u64(w, Command::BuildDerivation as u64).await?;
    write_string(w, &store_dir.display_path(drv_path)).await?;
    write_string(w, drv_text).await?;
    write_build_options(w, version, options).await?;
    w.flush().await?;

    read_build_result(r, version).await
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn roundtrip_result(version: ProtocolVersion, result: &BuildResult) -> BuildResult {
        let mut buf = Vec::new();
        write_build_result(&mut buf, version, result).await.unwrap();
        read_build_result(&mut buf.as_slice(), version).await.unwrap()
    }

    #[tokio::test]
    async fn test_string_padding() {
        let mut buf = Vec::new();
        write_string(&mut buf, "abc").await.unwrap();
        // 8 bytes length + 3 bytes payload + 5 bytes padding.
        assert_eq!(buf.len(), 16);
        assert_eq!(read_string(&mut buf.as_slice()).await.unwrap(), "abc");

        let mut buf = Vec::new();
        write_string(&mut buf, "12345678").await.unwrap();
        assert_eq!(buf.len(), 16, "aligned strings take no padding");
    }

    #[tokio::test]
    async fn test_handshake() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let server_task = tokio::spawn(async move {
            let (mut r, mut w) = tokio::io::split(&mut server);
            handshake_server(&mut r, &mut w).await
        });

        let (mut r, mut w) = tokio::io::split(&mut client);
        let client_version = handshake_client(&mut r, &mut w).await.unwrap();
        let server_version = server_task.await.unwrap().unwrap();

        assert_eq!(client_version, server_version);
        assert_eq!(client_version, PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn test_build_result_version_gating() {
        let mut result = BuildResult::success(BuildStatus::Built, BTreeMap::new());
        result.times_built = 3;
        result.start_time = 100;
        result.stop_time = 200;
        result.built_outputs.insert(
            "out".parse().unwrap(),
            Realisation::unsigned("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-x".parse().unwrap()),
        );

        // Minor 2: no build metrics, no outputs.
        let old = roundtrip_result(ProtocolVersion::new(2, 2), &result).await;
        assert_eq!(old.status, BuildStatus::Built);
        assert_eq!(old.times_built, 0);
        assert!(old.built_outputs.is_empty());

        // Minor 3: metrics, still no outputs.
        let mid = roundtrip_result(ProtocolVersion::new(2, 3), &result).await;
        assert_eq!(mid.times_built, 3);
        assert_eq!(mid.start_time, 100);
        assert!(mid.built_outputs.is_empty());

        // Minor 8: everything.
        let new = roundtrip_result(ProtocolVersion::new(2, 8), &result).await;
        assert_eq!(new.times_built, 3);
        assert_eq!(new.built_outputs.len(), 1);
    }

    #[tokio::test]
    async fn test_status_range_partition_on_wire() {
        let failure = BuildResult::failure(BuildError::Timeout);
        let read = roundtrip_result(PROTOCOL_VERSION, &failure).await;
        assert_eq!(read.status, BuildStatus::TimedOut);
        assert!(!read.is_success());
        assert!(read.error.is_some());

        let success = BuildResult::success(BuildStatus::Substituted, BTreeMap::new());
        let read = roundtrip_result(PROTOCOL_VERSION, &success).await;
        assert!(read.is_success());
        assert!(read.error.is_none());
    }

    #[tokio::test]
    async fn test_build_options_keep_failed_gating() {
        let options = WireBuildOptions {
            max_silent_time: Some(Duration::from_secs(10)),
            build_timeout: Some(Duration::from_secs(60)),
            max_log_size: 1024,
            nr_repeats: 1,
            keep_failed: true,
        };

        // At minor 7 the flag round-trips.
        let mut buf = Vec::new();
        write_build_options(&mut buf, ProtocolVersion::new(2, 7), &options)
            .await
            .unwrap();
        let read = read_build_options(&mut buf.as_slice(), ProtocolVersion::new(2, 7))
            .await
            .unwrap();
        assert!(read.keep_failed);
        assert_eq!(read.max_log_size, 1024);

        // Below minor 7 it is dropped, best-effort.
        let mut buf = Vec::new();
        write_build_options(&mut buf, ProtocolVersion::new(2, 6), &options)
            .await
            .unwrap();
        let read = read_build_options(&mut buf.as_slice(), ProtocolVersion::new(2, 6))
            .await
            .unwrap();
        assert!(!read.keep_failed);
        assert_eq!(read.nr_repeats, 1);
    }

    #[tokio::test]
    async fn test_path_info_minor4_gating() {
        let store_dir = StoreDir::default();
        let info = WirePathInfo {
            deriver: Some("zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz-x.drv".parse().unwrap()),
            references: vec!["aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-dep".parse().unwrap()],
            download_size: 10,
            nar_size: 20,
            nar_hash: Some(
                Hash::parse("sha256:1sfdxziarxw8j3p80lvswgpq9i7smdyxmmsj5sjhhgjdjfwjfkdr")
                    .unwrap(),
            ),
            ca: None,
            sigs: vec!["k:AAAA".into()],
        };

        let mut buf = Vec::new();
        write_path_info(&mut buf, ProtocolVersion::new(2, 4), &store_dir, &info)
            .await
            .unwrap();
        let read = read_path_info(&mut buf.as_slice(), ProtocolVersion::new(2, 4), &store_dir)
            .await
            .unwrap();
        assert_eq!(read, info);

        let mut buf = Vec::new();
        write_path_info(&mut buf, ProtocolVersion::new(2, 3), &store_dir, &info)
            .await
            .unwrap();
        let read = read_path_info(&mut buf.as_slice(), ProtocolVersion::new(2, 3), &store_dir)
            .await
            .unwrap();
        assert!(read.nar_hash.is_none());
        assert!(read.sigs.is_empty());
        assert_eq!(read.references, info.references);
    }

    #[tokio::test]
    async fn test_build_derivation_client_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(65536);
        let store_dir = StoreDir::default();
        let drv_path: StorePath = "zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz-demo.drv".parse().unwrap();

        let server_dir = store_dir.clone();
        let server_task = tokio::spawn(async move {
            let (mut r, mut w) = tokio::io::split(&mut server);
            let version = handshake_server(&mut r, &mut w).await.unwrap();

            let command = read_u64(&mut r).await.unwrap();
            assert_eq!(Command::from_code(command), Some(Command::BuildDerivation));
            let sent_path = read_string(&mut r).await.unwrap();
            assert!(sent_path.starts_with(server_dir.as_str()));
            let drv_text = read_string(&mut r).await.unwrap();
            assert!(drv_text.starts_with("Derive("));
            let options = read_build_options(&mut r, version).await.unwrap();
            assert_eq!(options.max_log_size, 4096);

            let mut result = BuildResult::success(BuildStatus::Built, BTreeMap::new());
            result.times_built = 1;
            write_build_result(&mut w, version, &result).await.unwrap();
        });

        let (mut r, mut w) = tokio::io::split(&mut client);
        let version = handshake_client(&mut r, &mut w).await.unwrap();
        let result = build_derivation(
            &mut r,
            &mut w,
            version,
            &store_dir,
            &drv_path,
            "Derive([],[],[],\"x86_64-linux\",\"/bin/sh\",[],[])",
            &WireBuildOptions {
                max_log_size: 4096,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        server_task.await.unwrap();
        assert_eq!(result.status, BuildStatus::Built);
        assert_eq!(result.times_built, 1);
    }
}
