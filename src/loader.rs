use anyhow::Context;
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::net::TcpStream;

use crate::error::{Error, Result};
use crate::spirit::SummonOptions;

/// Where a Spirit's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpiritSource {
    Bytes(Vec<u8>),
    Path(PathBuf),
    /// `file://`, `http://`, or `oci://` reference.
    Uri(String),
}

impl SpiritSource {
    /// Treat anything with a scheme as a URI and everything else as a path.
    pub fn parse(location: &str) -> Self {
        if location.contains("://") {
            SpiritSource::Uri(location.to_string())
        } else {
            SpiritSource::Path(PathBuf::from(location))
        }
    }
}

impl fmt::Display for SpiritSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpiritSource::Bytes(bytes) => write!(f, "<{} bytes>", bytes.len()),
            SpiritSource::Path(path) => write!(f, "{}", path.display()),
            SpiritSource::Uri(uri) => write!(f, "{uri}"),
        }
    }
}

impl From<&str> for SpiritSource {
    fn from(location: &str) -> Self {
        Self::parse(location)
    }
}

impl From<String> for SpiritSource {
    fn from(location: String) -> Self {
        Self::parse(&location)
    }
}

impl From<PathBuf> for SpiritSource {
    fn from(path: PathBuf) -> Self {
        SpiritSource::Path(path)
    }
}

impl From<&Path> for SpiritSource {
    fn from(path: &Path) -> Self {
        SpiritSource::Path(path.to_path_buf())
    }
}

impl From<Vec<u8>> for SpiritSource {
    fn from(bytes: Vec<u8>) -> Self {
        SpiritSource::Bytes(bytes)
    }
}

/// Resolve a source to Wasm bytes.
pub async fn read_bytes(source: &SpiritSource) -> Result<Vec<u8>> {
    let fetched = match source {
        SpiritSource::Bytes(bytes) => Ok(bytes.clone()),
        SpiritSource::Path(path) => tokio::fs::read(path)
            .await
            .with_context(|| format!("cannot read {}", path.display())),
        SpiritSource::Uri(uri) => read_uri(uri).await,
    };
    fetched.map_err(|reason| Error::Fetch {
        source_name: source.to_string(),
        reason,
    })
}

async fn read_uri(uri: &str) -> anyhow::Result<Vec<u8>> {
    if let Some(oci_ref) = uri.strip_prefix("oci://") {
        let client = wasm_pkg_client::oci::client::Client::new(Default::default());
        let image_ref = oci_ref.parse()?;
        let auth = oci_client::secrets::RegistryAuth::Anonymous;
        let media_types = vec!["application/wasm", "application/vnd.wasm.component"];

        let image_data = client.pull(&image_ref, &auth, media_types).await?;

        // The module bytes are the first layer
        if let Some(layer) = image_data.layers.first() {
            Ok(layer.data.to_vec())
        } else {
            Err(anyhow::anyhow!("No layers found in OCI image: {}", oci_ref))
        }
    } else if uri.starts_with("http://") {
        read_http(uri).await
    } else if uri.starts_with("https://") {
        Err(anyhow::anyhow!(
            "https is not supported; fetch the module yourself and load its bytes"
        ))
    } else {
        let path = uri.strip_prefix("file://").unwrap_or(uri);
        Ok(tokio::fs::read(path).await?)
    }
}

async fn read_http(uri: &str) -> anyhow::Result<Vec<u8>> {
    let url: hyper::Uri = uri.parse()?;
    let host = url
        .host()
        .ok_or_else(|| anyhow::anyhow!("URI has no host: {uri}"))?
        .to_string();
    let port = url.port_u16().unwrap_or(80);
    let authority = url
        .authority()
        .map(|a| a.to_string())
        .unwrap_or_else(|| host.clone());

    let stream = TcpStream::connect((host.as_str(), port)).await?;
    let (mut sender, connection) =
        hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::warn!("spirit fetch connection failed: {e}");
        }
    });

    let path = url.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    let request = hyper::Request::builder()
        .uri(path)
        .header(hyper::header::HOST, authority)
        .body(Empty::<Bytes>::new())?;
    let response = sender.send_request(request).await?;
    if !response.status().is_success() {
        anyhow::bail!("GET {uri} returned {}", response.status());
    }
    let body = response.into_body().collect().await?.to_bytes();
    Ok(body.to_vec())
}

/// Memory limits as written in a manifest; unset values fall back to the
/// session defaults.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryDefinition {
    pub initial: Option<u32>,
    pub maximum: Option<u32>,
}

/// One `[name]` table of a séance manifest.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SpiritDefinitionBase {
    pub uri: String,
    pub debug: Option<bool>,
    pub memory: Option<MemoryDefinition>,
    pub heap_base: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct SpiritDefinition {
    pub name: String,
    pub base: SpiritDefinitionBase,
    /// Directory relative paths in `uri` are resolved against.
    pub root: Option<PathBuf>,
}

impl std::ops::Deref for SpiritDefinition {
    type Target = SpiritDefinitionBase;
    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

impl SpiritDefinition {
    /// Where to load the module from. Relative paths, with or without a
    /// `file://` scheme, are taken from the manifest's directory.
    pub fn source(&self) -> SpiritSource {
        let relative = match SpiritSource::parse(&self.uri) {
            SpiritSource::Path(path) if path.is_relative() => path,
            SpiritSource::Uri(uri) => match uri.strip_prefix("file://").map(Path::new) {
                Some(path) if path.is_relative() => path.to_path_buf(),
                _ => return SpiritSource::Uri(uri),
            },
            other => return other,
        };
        match &self.root {
            Some(root) => SpiritSource::Path(root.join(relative)),
            None => SpiritSource::Path(relative),
        }
    }

    /// This definition's settings, to be layered over a séance's defaults.
    pub fn summon_options(&self) -> SummonOptions {
        let memory = self.memory.clone().unwrap_or_default();
        SummonOptions {
            initial_pages: memory.initial,
            maximum_pages: memory.maximum,
            heap_base: self.heap_base,
            debug: self.debug,
            ..SummonOptions::default()
        }
    }
}

/// Parse séance manifests. Within a file, Spirits are ordered by name.
pub fn load_manifest(paths: &[PathBuf]) -> Result<Vec<SpiritDefinition>> {
    let mut definitions = Vec::new();
    for path in paths {
        definitions.extend(parse_manifest_file(path)?);
    }

    // Collision detection - ensure unique names across all manifests
    let mut all_names = HashSet::new();
    for def in &definitions {
        if !all_names.insert(def.name.as_str()) {
            return Err(Error::Manifest(format!(
                "Duplicate spirit name: '{}'",
                def.name
            )));
        }
    }
    Ok(definitions)
}

fn parse_manifest_file(path: &Path) -> Result<Vec<SpiritDefinition>> {
    let content = fs::read_to_string(path)
        .map_err(|e| Error::Manifest(format!("cannot read {}: {e}", path.display())))?;
    parse_manifest(&content, path.parent().map(Path::to_path_buf))
}

/// Parse manifest text; `root` anchors relative module paths.
pub fn parse_manifest(content: &str, root: Option<PathBuf>) -> Result<Vec<SpiritDefinition>> {
    let toml_doc: toml::Table =
        toml::from_str(content).map_err(|e| Error::Manifest(e.to_string()))?;

    let mut definitions = Vec::new();
    for (name, value) in toml_doc {
        let toml::Value::Table(def_table) = value else {
            return Err(Error::Manifest(format!("Definition '{name}' must be a table")));
        };
        if !def_table.contains_key("uri") {
            return Err(Error::Manifest(format!(
                "Definition '{name}' missing required 'uri' field"
            )));
        }
        let base: SpiritDefinitionBase = toml::Value::Table(def_table)
            .try_into()
            .map_err(|e| Error::Manifest(format!("Failed to parse spirit '{name}': {e}")))?;
        definitions.push(SpiritDefinition {
            name,
            base,
            root: root.clone(),
        });
    }
    Ok(definitions)
}
