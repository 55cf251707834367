use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{detect_source, direct_item, is_playlist, is_url, TrackResolver};
use crate::audio::queue::PlayableItem;

/// Campos separados por tabulador: url, título, autor, duración en segundos
const PRINT_TEMPLATE: &str = "%(webpage_url,url)s\t%(title)s\t%(uploader)s\t%(duration)s";

const RESOLVE_TIMEOUT: Duration = Duration::from_secs(45);

/// Resuelve consultas con el binario `yt-dlp` sin descargar audio.
///
/// Texto libre se busca con `ytsearch1:`; las playlists se expanden en
/// modo plano hasta `max_playlist_size` entradas.
pub struct YtDlpResolver {
    binary: String,
    max_playlist_size: usize,
}

impl YtDlpResolver {
    pub fn new(max_playlist_size: usize) -> Self {
        Self {
            binary: "yt-dlp".to_string(),
            max_playlist_size: max_playlist_size.max(1),
        }
    }

    /// Verifica que yt-dlp esté instalado
    pub async fn verify(&self) -> Result<String> {
        let output = Command::new(&self.binary)
            .arg("--version")
            .output()
            .await
            .context("yt-dlp no encontrado. Instala con: pip install yt-dlp")?;

        if !output.status.success() {
            bail!("yt-dlp no disponible");
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn args_for(&self, query: &str) -> Vec<String> {
        let mut args = Self::base_args();
        if is_playlist(query) {
            args.extend(["--flat-playlist".to_string(), "--playlist-end".to_string()]);
            args.push(self.max_playlist_size.to_string());
            args.push(query.to_string());
        } else if is_url(query) {
            args.push("--no-playlist".to_string());
            args.push(query.to_string());
        } else {
            args.push(format!("ytsearch1:{}", query));
        }
        args
    }

    /// Búsqueda de varios resultados en modo plano (sin resolver cada video)
    fn search_args(query: &str, limit: usize) -> Vec<String> {
        let mut args = Self::base_args();
        args.push("--flat-playlist".to_string());
        args.push(format!("ytsearch{}:{}", limit.max(1), query));
        args
    }

    fn base_args() -> Vec<String> {
        [
            "--print",
            PRINT_TEMPLATE,
            "--skip-download",
            "--quiet",
            "--no-warnings",
            "--socket-timeout",
            "15",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    async fn run(&self, args: Vec<String>, query: &str, limit: usize) -> Result<Vec<PlayableItem>> {
        let output = tokio::time::timeout(RESOLVE_TIMEOUT, Command::new(&self.binary).args(args).output())
            .await
            .context("yt-dlp tardó demasiado en responder")?
            .context("No se pudo ejecutar yt-dlp")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("yt-dlp falló: {}", stderr.trim());
            bail!("No se pudo obtener información de: {}", query);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let items: Vec<PlayableItem> = stdout.lines().filter_map(parse_print_line).take(limit).collect();

        if items.is_empty() {
            bail!("No se encontraron resultados para: {}", query);
        }
        debug!("✅ {} items resueltos para {}", items.len(), query);
        Ok(items)
    }
}

#[async_trait]
impl TrackResolver for YtDlpResolver {
    async fn resolve(&self, query: &str) -> Result<Vec<PlayableItem>> {
        let query = query.trim();
        if query.is_empty() {
            bail!("La búsqueda está vacía");
        }
        if let Some(item) = direct_item(query) {
            return Ok(vec![item]);
        }

        info!("🔍 Resolviendo con yt-dlp: {}", query);
        self.run(self.args_for(query), query, self.max_playlist_size).await
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<PlayableItem>> {
        let query = query.trim();
        let limit = limit.max(1);
        if query.is_empty() {
            bail!("La búsqueda está vacía");
        }
        if is_url(query) {
            let mut items = self.resolve(query).await?;
            items.truncate(limit);
            return Ok(items);
        }

        info!("🔍 Buscando {} resultados con yt-dlp: {}", limit, query);
        self.run(Self::search_args(query, limit), query, limit).await
    }
}

/// Interpreta una línea de `--print`. Los campos ausentes llegan como `NA`.
pub fn parse_print_line(line: &str) -> Option<PlayableItem> {
    let mut fields = line.trim_end().split('\t');
    let uri = fields.next().filter(|u| is_url(u))?;
    let title = fields
        .next()
        .filter(|t| !t.is_empty() && *t != "NA")
        .unwrap_or(uri);
    let author = fields.next().filter(|a| !a.is_empty() && *a != "NA");
    let duration_ms = fields
        .next()
        .and_then(|d| d.parse::<f64>().ok())
        .map(|secs| (secs * 1000.0) as u64)
        .unwrap_or(0);

    let item = PlayableItem::new(title, uri, duration_ms, detect_source(uri));
    Some(match author {
        Some(author) => item.with_author(author),
        None => item,
    })
}
