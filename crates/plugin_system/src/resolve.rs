//! URL classification and marketplace lookups.
//!
//! An install URL is either a direct `.jar` link or a project page on one of
//! the supported marketplaces. Project pages need a lookup that can return
//! several candidate builds (one per game version, release asset, ...), in
//! which case the caller has to pick one through a selection token.

use crate::error::PluginError;
use crate::transport::HttpTransport;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

/// Candidate builds shown per marketplace lookup.
const MAX_OPTIONS: usize = 10;

/// Loaders whose builds are server plugins.
const PLUGIN_LOADERS: [&str; 9] = [
    "bukkit", "spigot", "paper", "purpur", "folia", "sponge", "velocity", "bungeecord", "waterfall",
];

/// API roots of the supported marketplaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketplaceEndpoints {
    pub modrinth_api: String,
    pub spiget_api: String,
    pub github_api: String,
}

impl Default for MarketplaceEndpoints {
    fn default() -> Self {
        Self {
            modrinth_api: "https://api.modrinth.com/v2".to_string(),
            spiget_api: "https://api.spiget.org/v2".to_string(),
            github_api: "https://api.github.com".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Direct,
    Modrinth,
    Spigot,
    Github,
}

/// Result of classifying a URL, before any lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedUrl {
    Direct { url: Url, file_name: String },
    Modrinth { slug: String, version: Option<String> },
    Spigot { resource_id: u64 },
    Github { owner: String, repo: String, tag: Option<String> },
}

impl ParsedUrl {
    pub fn kind(&self) -> SourceKind {
        match self {
            ParsedUrl::Direct { .. } => SourceKind::Direct,
            ParsedUrl::Modrinth { .. } => SourceKind::Modrinth,
            ParsedUrl::Spigot { .. } => SourceKind::Spigot,
            ParsedUrl::Github { .. } => SourceKind::Github,
        }
    }
}

/// One downloadable JAR build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadOption {
    /// Stable identifier accepted as a selection token
    pub id: String,
    pub label: String,
    pub url: String,
    pub file_name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub game_versions: Vec<String>,
}

/// Candidates found for an install URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedSource {
    pub kind: SourceKind,
    /// Marketplace project title, when known
    pub project: Option<String>,
    /// Marketplace category, when known
    pub category: Option<String>,
    pub options: Vec<DownloadOption>,
}

/// Outcome of applying a selection token to a [`ResolvedSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Chosen(DownloadOption),
    Ambiguous(Vec<DownloadOption>),
}

impl ResolvedSource {
    /// Picks the build to download.
    ///
    /// A single candidate is chosen implicitly. With several candidates the
    /// token must match an option id or be a zero-based index.
    pub fn select(&self, token: Option<&str>) -> Result<Selection, PluginError> {
        if self.options.is_empty() {
            return Err(PluginError::Validation(
                "no downloadable .jar file found for this source".to_string(),
            ));
        }

        let Some(token) = token.map(str::trim).filter(|t| !t.is_empty()) else {
            return Ok(match self.options.as_slice() {
                [only] => Selection::Chosen(only.clone()),
                many => Selection::Ambiguous(many.to_vec()),
            });
        };

        if let Some(option) = self.options.iter().find(|o| o.id == token) {
            return Ok(Selection::Chosen(option.clone()));
        }
        if let Some(option) = token.parse::<usize>().ok().and_then(|i| self.options.get(i)) {
            return Ok(Selection::Chosen(option.clone()));
        }
        Err(PluginError::Validation(format!(
            "selected option '{}' does not match any of the {} available builds",
            token,
            self.options.len()
        )))
    }
}

/// Classifies `raw` without touching the network.
pub fn parse_url(raw: &str) -> Result<ParsedUrl, PluginError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(PluginError::Validation("URL is required".to_string()));
    }
    let url = Url::parse(raw).map_err(|e| PluginError::InvalidUrl(format!("{}: {}", raw, e)))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(PluginError::InvalidUrl(format!(
            "{}: only http and https URLs are supported",
            raw
        )));
    }

    let segments: Vec<String> = url
        .path_segments()
        .map(|s| s.filter(|p| !p.is_empty()).map(str::to_string).collect())
        .unwrap_or_default();

    if let Some(last) = segments.last() {
        if last.to_ascii_lowercase().ends_with(".jar") {
            return Ok(ParsedUrl::Direct {
                file_name: last.clone(),
                url,
            });
        }
    }

    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    let parts: Vec<&str> = segments.iter().map(String::as_str).collect();

    match (host, parts.as_slice()) {
        ("modrinth.com", [kind, slug, rest @ ..]) if matches!(*kind, "plugin" | "mod" | "project" | "datapack") => {
            let version = match rest {
                ["version", v, ..] => Some(v.to_string()),
                _ => None,
            };
            Ok(ParsedUrl::Modrinth {
                slug: slug.to_string(),
                version,
            })
        }
        ("spigotmc.org", ["resources", resource, ..]) => {
            let id_text = resource.rsplit('.').next().unwrap_or(*resource);
            let resource_id = id_text.parse::<u64>().map_err(|_| {
                PluginError::InvalidUrl(format!("{}: SpigotMC URL has no resource id", raw))
            })?;
            Ok(ParsedUrl::Spigot { resource_id })
        }
        ("github.com", [owner, repo, rest @ ..]) => {
            let tag = match rest {
                ["releases", "tag", tag, ..] => Some(tag.to_string()),
                [] | ["releases"] | ["releases", "latest"] => None,
                _ => {
                    return Err(PluginError::InvalidUrl(format!(
                        "{}: expected a GitHub repository or release URL",
                        raw
                    )))
                }
            };
            Ok(ParsedUrl::Github {
                owner: owner.to_string(),
                repo: repo.trim_end_matches(".git").to_string(),
                tag,
            })
        }
        _ => Err(PluginError::InvalidUrl(format!(
            "{}: expected a direct .jar link or a Modrinth, SpigotMC or GitHub project URL",
            raw
        ))),
    }
}

/// Performs marketplace lookups through an [`HttpTransport`].
pub struct Resolver<'a> {
    transport: &'a dyn HttpTransport,
    endpoints: &'a MarketplaceEndpoints,
}

impl<'a> Resolver<'a> {
    pub fn new(transport: &'a dyn HttpTransport, endpoints: &'a MarketplaceEndpoints) -> Self {
        Self { transport, endpoints }
    }

    /// Classifies `raw` and looks up its candidate builds.
    pub async fn resolve(&self, raw: &str) -> Result<ResolvedSource, PluginError> {
        match parse_url(raw)? {
            ParsedUrl::Direct { url, file_name } => Ok(ResolvedSource {
                kind: SourceKind::Direct,
                project: None,
                category: None,
                options: vec![DownloadOption {
                    id: "direct".to_string(),
                    label: file_name.clone(),
                    url: url.to_string(),
                    file_name,
                    version: None,
                    game_versions: vec![],
                }],
            }),
            ParsedUrl::Modrinth { slug, version } => self.modrinth(&slug, version.as_deref()).await,
            ParsedUrl::Spigot { resource_id } => self.spigot(resource_id).await,
            ParsedUrl::Github { owner, repo, tag } => self.github(&owner, &repo, tag.as_deref()).await,
        }
    }

    fn endpoint(base: &str, path: &str) -> Result<Url, PluginError> {
        let joined = format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'));
        Url::parse(&joined).map_err(|e| PluginError::InvalidUrl(format!("{}: {}", joined, e)))
    }

    async fn modrinth(&self, slug: &str, version: Option<&str>) -> Result<ResolvedSource, PluginError> {
        debug!("Looking up Modrinth project {}", slug);
        let versions_url = Self::endpoint(&self.endpoints.modrinth_api, &format!("project/{}/version", slug))?;
        let versions = self.transport.get_json(&versions_url).await?;
        let versions = versions
            .as_array()
            .ok_or_else(|| unexpected(&versions_url, "expected a version list"))?;

        let mut options = Vec::new();
        for entry in versions {
            let id = str_field(entry, "id");
            let number = str_field(entry, "version_number");
            if let Some(wanted) = version {
                if id.as_deref() != Some(wanted) && number.as_deref() != Some(wanted) {
                    continue;
                }
            }
            let loaders = str_list(entry, "loaders");
            if !loaders.is_empty() && !loaders.iter().any(|l| PLUGIN_LOADERS.contains(&l.as_str())) {
                continue;
            }
            let Some(file) = pick_modrinth_file(entry) else { continue };
            let (Some(id), Some(url), Some(file_name)) = (id, str_field(file, "url"), str_field(file, "filename")) else {
                continue;
            };
            let game_versions = str_list(entry, "game_versions");
            let name = str_field(entry, "name").or_else(|| number.clone()).unwrap_or_else(|| id.clone());
            options.push(DownloadOption {
                label: label_with_versions(&name, &game_versions),
                id,
                url,
                file_name,
                version: number,
                game_versions,
            });
            if options.len() >= MAX_OPTIONS {
                break;
            }
        }

        if let (Some(wanted), true) = (version, options.is_empty()) {
            return Err(PluginError::NotFound(format!("Modrinth version {} of {}", wanted, slug)));
        }

        // project metadata only decorates the record
        let project_url = Self::endpoint(&self.endpoints.modrinth_api, &format!("project/{}", slug))?;
        let (project, category) = match self.transport.get_json(&project_url).await {
            Ok(project) => (
                str_field(&project, "title"),
                str_list(&project, "categories").into_iter().next(),
            ),
            Err(e) => {
                warn!("Modrinth project lookup for {} failed: {}", slug, e);
                (None, None)
            }
        };

        Ok(ResolvedSource {
            kind: SourceKind::Modrinth,
            project: project.or_else(|| Some(slug.to_string())),
            category,
            options,
        })
    }

    async fn spigot(&self, resource_id: u64) -> Result<ResolvedSource, PluginError> {
        debug!("Looking up SpigotMC resource {}", resource_id);
        let resource_url = Self::endpoint(&self.endpoints.spiget_api, &format!("resources/{}", resource_id))?;
        let resource = self.transport.get_json(&resource_url).await?;
        if !resource.is_object() {
            return Err(unexpected(&resource_url, "expected a resource object"));
        }

        let name = str_field(&resource, "name").unwrap_or_else(|| format!("resource-{}", resource_id));
        if resource.get("premium").and_then(Value::as_bool).unwrap_or(false) {
            return Err(PluginError::Validation(format!(
                "{} is a premium SpigotMC resource and cannot be downloaded automatically",
                name
            )));
        }
        let external = resource.get("external").and_then(Value::as_bool).unwrap_or(false)
            || resource
                .get("file")
                .and_then(|f| str_field(f, "type"))
                .is_some_and(|t| t.eq_ignore_ascii_case("external"));
        if external {
            return Err(PluginError::Validation(format!(
                "{} is hosted externally; use its direct .jar link instead",
                name
            )));
        }

        let download_url = Self::endpoint(&self.endpoints.spiget_api, &format!("resources/{}/download", resource_id))?;
        let tested = str_list(&resource, "testedVersions");
        let file_name = format!("{}.jar", sanitize_file_stem(&name));

        Ok(ResolvedSource {
            kind: SourceKind::Spigot,
            project: Some(name.clone()),
            category: None,
            options: vec![DownloadOption {
                id: resource_id.to_string(),
                label: label_with_versions(&name, &tested),
                url: download_url.to_string(),
                file_name,
                version: None,
                game_versions: tested,
            }],
        })
    }

    async fn github(&self, owner: &str, repo: &str, tag: Option<&str>) -> Result<ResolvedSource, PluginError> {
        debug!("Looking up GitHub release of {}/{}", owner, repo);
        let path = match tag {
            Some(tag) => format!("repos/{}/{}/releases/tags/{}", owner, repo, tag),
            None => format!("repos/{}/{}/releases/latest", owner, repo),
        };
        let release_url = Self::endpoint(&self.endpoints.github_api, &path)?;
        let release = self.transport.get_json(&release_url).await?;
        let assets = release
            .get("assets")
            .and_then(Value::as_array)
            .ok_or_else(|| unexpected(&release_url, "release has no asset list"))?;
        let tag_name = str_field(&release, "tag_name");

        let options = assets
            .iter()
            .filter_map(|asset| {
                let file_name = str_field(asset, "name")?;
                if !file_name.to_ascii_lowercase().ends_with(".jar") {
                    return None;
                }
                let url = str_field(asset, "browser_download_url")?;
                let id = asset
                    .get("id")
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| file_name.clone());
                Some(DownloadOption {
                    id,
                    label: file_name.clone(),
                    url,
                    file_name,
                    version: tag_name.clone(),
                    game_versions: vec![],
                })
            })
            .take(MAX_OPTIONS)
            .collect();

        Ok(ResolvedSource {
            kind: SourceKind::Github,
            project: Some(format!("{}/{}", owner, repo)),
            category: None,
            options,
        })
    }
}

fn pick_modrinth_file(version: &Value) -> Option<&Value> {
    let files = version.get("files")?.as_array()?;
    let is_jar = |f: &&Value| {
        str_field(f, "filename").is_some_and(|n| n.to_ascii_lowercase().ends_with(".jar"))
    };
    files
        .iter()
        .filter(is_jar)
        .find(|f| f.get("primary").and_then(Value::as_bool).unwrap_or(false))
        .or_else(|| files.iter().find(is_jar))
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

fn str_list(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

fn label_with_versions(name: &str, game_versions: &[String]) -> String {
    match game_versions {
        [] => name.to_string(),
        [one] => format!("{} (MC {})", name, one),
        [first, .., last] => format!("{} (MC {} - {})", name, first, last),
    }
}

fn sanitize_file_stem(name: &str) -> String {
    let stem: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if stem.is_empty() {
        "plugin".to_string()
    } else {
        stem
    }
}

fn unexpected(url: &Url, what: &str) -> PluginError {
    PluginError::Network(format!("unexpected response from {}: {}", url, what))
}
