//! Generation naming, manifest install and activation cleanup.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::sync::Arc;
use tracing::{debug, info};

use crate::cache::{CacheStorage, Generation, GenerationKind};
use crate::config::Config;
use crate::net::{Fetcher, Request, Response};

/// Meta key recording which version last completed activation.
const ACTIVE_VERSION_KEY: &str = "active_version";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
  /// Manifest fetched and committed as the new static generation
  Installed { entries: usize },
  /// Static generation for this version already exists; nothing to do
  AlreadyInstalled,
}

/// Owns the static/dynamic generation names for one deployed version.
pub struct GenerationManager<S: CacheStorage> {
  storage: Arc<S>,
  version: String,
  static_generation: Generation,
  dynamic_generation: Generation,
}

impl<S: CacheStorage> GenerationManager<S> {
  pub fn new(storage: Arc<S>, config: &Config) -> Self {
    Self {
      storage,
      version: config.version.clone(),
      static_generation: Generation {
        name: config.static_generation(),
        kind: GenerationKind::Static,
      },
      dynamic_generation: Generation {
        name: config.dynamic_generation(),
        kind: GenerationKind::Dynamic,
      },
    }
  }

  pub fn dynamic_generation(&self) -> &Generation {
    &self.dynamic_generation
  }

  /// Version recorded by the last completed activation, if any.
  pub fn active_version(&self) -> Result<Option<String>> {
    self.storage.get_meta(ACTIVE_VERSION_KEY)
  }

  /// True when this exact version is installed and was already activated.
  pub fn is_current(&self) -> Result<bool> {
    Ok(
      self.active_version()?.as_deref() == Some(self.version.as_str())
        && self.storage.has_generation(&self.static_generation.name)?,
    )
  }

  /// Load every manifest entry into the static generation.
  ///
  /// All entries are fetched before anything is written, and the write is a
  /// single transaction: a failed entry leaves the store untouched.
  pub async fn install(&self, manifest: &[Request], fetcher: &dyn Fetcher) -> Result<InstallOutcome> {
    if self.storage.has_generation(&self.static_generation.name)? {
      debug!(generation = %self.static_generation.name, "Static generation already installed");
      return Ok(InstallOutcome::AlreadyInstalled);
    }

    info!(
      generation = %self.static_generation.name,
      entries = manifest.len(),
      "Caching static assets"
    );

    let entries = fetch_all(manifest, fetcher).await?;
    self.storage.put_all(&self.static_generation, &entries)?;

    Ok(InstallOutcome::Installed {
      entries: entries.len(),
    })
  }

  /// Purge every generation other than the current static and dynamic ones,
  /// then record this version as active. Returns the purged names.
  pub fn activate(&self) -> Result<Vec<String>> {
    if !self.storage.has_generation(&self.static_generation.name)? {
      return Err(eyre!(
        "Cannot activate {}: static generation {} is not installed",
        self.version,
        self.static_generation.name
      ));
    }

    self.storage.open_generation(&self.dynamic_generation)?;

    let mut purged = Vec::new();
    for generation in self.storage.generations()? {
      if generation.name == self.static_generation.name
        || generation.name == self.dynamic_generation.name
      {
        continue;
      }

      info!(generation = %generation.name, "Deleting old generation");
      self.storage.delete_generation(&generation.name)?;
      purged.push(generation.name);
    }

    self.storage.set_meta(ACTIVE_VERSION_KEY, &self.version)?;
    Ok(purged)
  }

  /// Fetch additional URLs into the dynamic generation, all or nothing.
  pub async fn preload(&self, urls: &[Request], fetcher: &dyn Fetcher) -> Result<usize> {
    let entries = fetch_all(urls, fetcher).await?;
    self.storage.put_all(&self.dynamic_generation, &entries)?;
    Ok(entries.len())
  }

  /// Drop every dynamic entry, leaving an empty dynamic generation behind.
  pub fn clear_dynamic(&self) -> Result<()> {
    self.storage.delete_generation(&self.dynamic_generation.name)?;
    self.storage.open_generation(&self.dynamic_generation)
  }
}

/// Fetch every request concurrently; any transport failure or non-2xx fails the batch.
async fn fetch_all(requests: &[Request], fetcher: &dyn Fetcher) -> Result<Vec<(Request, Response)>> {
  try_join_all(requests.iter().map(|request| async move {
    let response = fetcher.fetch(request).await?;
    if !response.is_success() {
      return Err(eyre!(
        "Failed to load {}: status {}",
        request.url,
        response.status
      ));
    }
    Ok::<_, color_eyre::Report>((request.clone(), response))
  }))
  .await
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::config::test_config;
  use crate::net::testing::ScriptedFetcher;

  fn manifest(config: &Config) -> Vec<Request> {
    config
      .manifest
      .iter()
      .map(|path| Request::get(config.resolve(path).unwrap()))
      .collect()
  }

  fn serve_manifest(config: &Config, fetcher: &ScriptedFetcher) {
    for path in &config.manifest {
      let url = config.resolve(path).unwrap();
      fetcher.respond(url.as_str(), Response::new(200, format!("body of {}", path)));
    }
  }

  fn setup() -> (Config, Arc<SqliteStorage>, GenerationManager<SqliteStorage>) {
    let config = test_config();
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let manager = GenerationManager::new(Arc::clone(&storage), &config);
    (config, storage, manager)
  }

  #[tokio::test]
  async fn test_install_stores_manifest_verbatim() {
    let (config, storage, manager) = setup();
    let fetcher = ScriptedFetcher::new();
    serve_manifest(&config, &fetcher);

    let outcome = manager.install(&manifest(&config), &fetcher).await.unwrap();
    assert_eq!(outcome, InstallOutcome::Installed { entries: 9 });

    for path in &config.manifest {
      let request = Request::get(config.resolve(path).unwrap());
      let hit = storage.match_in("learnmate-v1", &request).unwrap().unwrap();
      assert_eq!(hit.response.body, format!("body of {}", path).into_bytes());
    }
  }

  #[tokio::test]
  async fn test_failed_entry_commits_nothing() {
    let (config, storage, manager) = setup();
    let fetcher = ScriptedFetcher::new();
    serve_manifest(&config, &fetcher);
    fetcher.respond(
      config.resolve("/js/quiz.js").unwrap().as_str(),
      Response::new(404, "gone"),
    );

    assert!(manager.install(&manifest(&config), &fetcher).await.is_err());
    assert!(!storage.has_generation("learnmate-v1").unwrap());

    fetcher.fail(config.resolve("/js/quiz.js").unwrap().as_str());
    assert!(manager.install(&manifest(&config), &fetcher).await.is_err());
    assert!(storage.generations().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_reinstall_same_version_is_noop() {
    let (config, storage, manager) = setup();
    let fetcher = ScriptedFetcher::new();
    serve_manifest(&config, &fetcher);

    manager.install(&manifest(&config), &fetcher).await.unwrap();
    let calls = fetcher.calls();
    let again = manager.install(&manifest(&config), &fetcher).await.unwrap();

    assert_eq!(again, InstallOutcome::AlreadyInstalled);
    assert_eq!(fetcher.calls(), calls);
    assert_eq!(storage.entries("learnmate-v1").unwrap().len(), 9);
  }

  #[tokio::test]
  async fn test_activate_purges_stale_generations() {
    let (config, storage, manager) = setup();
    let fetcher = ScriptedFetcher::new();
    serve_manifest(&config, &fetcher);

    let stale = Generation {
      name: "learnmate-v0".to_string(),
      kind: GenerationKind::Static,
    };
    let foreign = Generation {
      name: "learnmate-dynamic-v1".to_string(),
      kind: GenerationKind::Dynamic,
    };
    storage.open_generation(&stale).unwrap();
    storage.open_generation(&foreign).unwrap();

    manager.install(&manifest(&config), &fetcher).await.unwrap();
    let purged = manager.activate().unwrap();

    assert_eq!(purged, vec!["learnmate-v0", "learnmate-dynamic-v1"]);
    let names: Vec<String> = storage
      .generations()
      .unwrap()
      .into_iter()
      .map(|g| g.name)
      .collect();
    assert_eq!(names, vec!["learnmate-v1", "learnmate-dynamic"]);
    assert!(manager.is_current().unwrap());
  }

  #[tokio::test]
  async fn test_activate_refuses_without_install() {
    let (_config, storage, manager) = setup();
    let previous = Generation {
      name: "learnmate-v0".to_string(),
      kind: GenerationKind::Static,
    };
    storage.open_generation(&previous).unwrap();

    assert!(manager.activate().is_err());
    assert!(storage.has_generation("learnmate-v0").unwrap());
    assert!(!manager.is_current().unwrap());
  }

  #[tokio::test]
  async fn test_preload_and_clear_dynamic() {
    let (config, storage, manager) = setup();
    let fetcher = ScriptedFetcher::new();
    let urls: Vec<Request> = ["/lessons/1.html", "/lessons/2.html"]
      .iter()
      .map(|p| Request::get(config.resolve(p).unwrap()))
      .collect();
    for request in &urls {
      fetcher.respond(request.url.as_str(), Response::new(200, "lesson"));
    }

    assert_eq!(manager.preload(&urls, &fetcher).await.unwrap(), 2);
    assert_eq!(storage.entries("learnmate-dynamic").unwrap().len(), 2);

    manager.clear_dynamic().unwrap();
    assert!(storage.has_generation("learnmate-dynamic").unwrap());
    assert!(storage.entries("learnmate-dynamic").unwrap().is_empty());
  }
}
