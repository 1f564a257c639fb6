use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::{debug, instrument, warn, Level};

use common::config::SsConfig;

// external url fetcher
//
// short video urls are handed to the yt-dlp subprocess: one json probe to
// enumerate the available qualities, then one download of the chosen
// format into the scratch directory.  the proxy and cookies workarounds
// live entirely in the argument list.

#[derive(Clone, Debug, PartialEq)]
pub struct FetchCandidate {
    pub format_id: String,
    pub label: String,
    pub height: Option<u32>,
    pub filesize: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct Probe {
    pub title: String,
    pub duration_seconds: Option<u64>,
    pub candidates: Vec<FetchCandidate>,
}

// parse the `yt-dlp -J` document: keep mp4-ish video formats with a known
// height, one candidate per height, best (largest) first
pub fn parse_probe(raw: &str) -> Result<Probe> {
    let doc: serde_json::Value = serde_json::from_str(raw).context("fetcher emitted bad json")?;

    let title = doc["title"].as_str().unwrap_or("video").to_string();

    let duration_seconds = doc["duration"].as_f64().map(|d| d.max(0.0) as u64);

    let mut candidates: Vec<FetchCandidate> = Vec::new();

    for format in doc["formats"].as_array().into_iter().flatten() {
        let vcodec = format["vcodec"].as_str().unwrap_or("none");
        if vcodec == "none" {
            continue;
        }

        let Some(height) = format["height"].as_u64() else {
            continue;
        };

        let Some(format_id) = format["format_id"].as_str() else {
            continue;
        };

        let ext = format["ext"].as_str().unwrap_or("mp4");
        if ext != "mp4" && ext != "webm" {
            continue;
        }

        let filesize = format["filesize"]
            .as_u64()
            .or_else(|| format["filesize_approx"].as_u64());

        let label = match filesize {
            Some(bytes) => format!(
                "{}p ({}, {:.1} MiB)",
                height,
                ext,
                bytes as f64 / (1024.0 * 1024.0)
            ),
            None => format!("{height}p ({ext})"),
        };

        let candidate = FetchCandidate {
            format_id: format_id.to_string(),
            label,
            height: Some(height as u32),
            filesize,
        };

        // one entry per height; later formats for the same height are
        // usually better encodes, so the last one wins
        match candidates.iter_mut().find(|c| c.height == candidate.height) {
            Some(existing) => *existing = candidate,
            None => candidates.push(candidate),
        }
    }

    candidates.sort_by(|a, b| b.height.cmp(&a.height));
    candidates.truncate(6);

    Ok(Probe {
        title,
        duration_seconds,
        candidates,
    })
}

pub struct Fetcher {
    config: Arc<SsConfig>,
}

impl Fetcher {
    pub fn new(config: Arc<SsConfig>) -> Self {
        Fetcher { config }
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.config.scratch_dir
    }

    async fn cookies_file(&self) -> Result<Option<PathBuf>> {
        let Some(blob) = &self.config.fetch_cookies else {
            return Ok(None);
        };

        let path = self.config.scratch_dir.join("cookies.txt");
        tokio::fs::write(&path, blob).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ =
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600));
        }

        Ok(Some(path))
    }

    fn common_args(&self, args: &mut Vec<String>, cookies: &Option<PathBuf>) {
        args.push("--no-playlist".to_string());

        if let Some(proxy) = &self.config.proxy_url {
            args.push("--proxy".to_string());
            args.push(proxy.clone());
        }

        if let Some(cookies) = cookies {
            args.push("--cookies".to_string());
            args.push(cookies.display().to_string());
        }
    }

    #[instrument(level = Level::DEBUG, skip(self))]
    pub async fn probe(&self, url: &str) -> Result<Probe> {
        tokio::fs::create_dir_all(&self.config.scratch_dir).await?;

        let cookies = self.cookies_file().await?;

        let mut args = vec!["-J".to_string()];
        self.common_args(&mut args, &cookies);
        args.push(url.to_string());

        let output = Command::new("yt-dlp")
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .context("failed to run yt-dlp")?;

        if !output.status.success() {
            return Err(anyhow::Error::msg(format!(
                "fetcher probe failed: {}",
                String::from_utf8_lossy(&output.stderr)
                    .lines()
                    .last()
                    .unwrap_or("unknown error")
            )));
        }

        parse_probe(&String::from_utf8_lossy(&output.stdout))
    }

    // download one format into dest; the size cap is enforced both by the
    // subprocess and by a post-check, since --max-filesize is advisory for
    // some extractors
    #[instrument(level = Level::DEBUG, skip(self, dest))]
    pub async fn download(&self, url: &str, format_id: &str, dest: &Path) -> Result<()> {
        tokio::fs::create_dir_all(&self.config.scratch_dir).await?;

        let cookies = self.cookies_file().await?;

        let mut args = vec![
            "-f".to_string(),
            format_id.to_string(),
            "-o".to_string(),
            dest.display().to_string(),
            "--max-filesize".to_string(),
            self.config.max_file_bytes.to_string(),
            "--quiet".to_string(),
        ];
        self.common_args(&mut args, &cookies);
        args.push(url.to_string());

        let status = Command::new("yt-dlp")
            .args(&args)
            .stdin(Stdio::null())
            .status()
            .await
            .context("failed to run yt-dlp")?;

        if !status.success() {
            return Err(anyhow::Error::msg("fetcher download failed"));
        }

        let len = tokio::fs::metadata(dest)
            .await
            .context("fetcher produced no file")?
            .len();

        if len > self.config.max_file_bytes {
            return Err(anyhow::Error::msg("downloaded file exceeds the size cap"));
        }

        debug!({ bytes = len }, "download complete");
        Ok(())
    }
}

// scratch files are deleted on every exit path, including panics and
// early returns, by tying removal to drop
pub struct ScratchFile {
    path: PathBuf,
}

impl ScratchFile {
    pub fn new(path: PathBuf) -> Self {
        ScratchFile { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if self.path.exists() && std::fs::remove_file(&self.path).is_err() {
            warn!({ path = %self.path.display() }, "failed to remove scratch file");
        }
    }
}
