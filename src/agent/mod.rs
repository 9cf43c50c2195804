//! The offline content agent: lifecycle, request interception and background work.

pub mod eviction;
pub mod generations;
pub mod notify;
pub mod retry;
pub mod router;

use color_eyre::Result;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::cache::{CacheLayer, SqliteStorage};
use crate::config::Config;
use crate::net::{Fetcher, Request};

use eviction::EvictionPolicy;
use generations::{GenerationManager, InstallOutcome};
use notify::{NotificationDispatcher, Platform};
use retry::{DrainOutcome, RetryQueue};
use router::{FetchOutcome, Router};

/// Lifecycle state of the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
  Idle,
  Installing,
  /// Installed, waiting for an activate-now message
  Installed,
  Activating,
  Active,
  ShutDown,
}

/// Control messages from the page.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
  /// Activate now instead of waiting
  SkipWaiting,
  /// Preload additional URLs into the dynamic generation
  CacheUrls { urls: Vec<String> },
  /// Empty the dynamic generation
  ClearCache,
}

/// Events delivered to the agent by its host.
#[derive(Debug)]
pub enum AgentEvent {
  Fetch { id: u64, request: Request },
  Sync { tag: String },
  Push { data: Option<String> },
  NotificationClick { action: Option<String> },
  Message(ControlMessage),
  Shutdown,
}

/// The agent service: owns generation names, the store, the retry queue and
/// the eviction settings for one deployed version.
pub struct Agent {
  config: Config,
  storage: Arc<SqliteStorage>,
  fetcher: Arc<dyn Fetcher>,
  generations: GenerationManager<SqliteStorage>,
  router: Router<SqliteStorage>,
  retry: Arc<RetryQueue<SqliteStorage>>,
  notifications: NotificationDispatcher,
  eviction: EvictionPolicy,
  lifecycle: watch::Sender<Lifecycle>,
  /// Set once any version has been activated; until then requests pass through
  controlling: AtomicBool,
  shutdown: watch::Sender<bool>,
}

impl Agent {
  pub fn new(
    config: Config,
    storage: Arc<SqliteStorage>,
    fetcher: Arc<dyn Fetcher>,
    platform: Arc<dyn Platform>,
  ) -> Result<Self> {
    let generations = GenerationManager::new(Arc::clone(&storage), &config);

    let offline_page = config
      .offline_page
      .as_deref()
      .map(|page| config.resolve(page).map(Request::get))
      .transpose()?;
    let cache = CacheLayer::new(
      Arc::clone(&storage),
      generations.dynamic_generation().clone(),
    )
    .with_offline_page(offline_page);

    let retry = Arc::new(RetryQueue::new(Arc::clone(&storage)));
    let router = Router::new(
      config.origin.clone(),
      config.api_prefix.clone(),
      cache,
      Arc::clone(&retry),
      Arc::clone(&fetcher),
    );

    let notifications = NotificationDispatcher::new(
      config.notifications.clone(),
      config.resolve(&config.notifications.app_path)?,
      platform,
    );

    let eviction = EvictionPolicy::new(&config.dynamic);
    let (lifecycle, _) = watch::channel(Lifecycle::Idle);
    let (shutdown, _) = watch::channel(false);

    Ok(Self {
      config,
      storage,
      fetcher,
      generations,
      router,
      retry,
      notifications,
      eviction,
      lifecycle,
      controlling: AtomicBool::new(false),
      shutdown,
    })
  }

  pub fn lifecycle(&self) -> Lifecycle {
    *self.lifecycle.borrow()
  }

  /// Observe lifecycle transitions.
  pub fn subscribe_lifecycle(&self) -> watch::Receiver<Lifecycle> {
    self.lifecycle.subscribe()
  }

  fn transition(&self, state: Lifecycle) {
    let previous = self.lifecycle.send_replace(state);
    if previous != state {
      info!(from = ?previous, to = ?state, "Lifecycle transition");
    }
  }

  /// Bring the agent up for the configured version.
  ///
  /// If this version was already activated, nothing is fetched or purged.
  /// Otherwise the manifest is installed and, with `skip_waiting`, activated.
  /// A failed install leaves any previously activated version in control.
  pub async fn init(&self) -> Result<()> {
    if self.generations.is_current()? {
      info!(version = %self.config.version, "Version already active");
      self.controlling.store(true, Ordering::SeqCst);
      self.transition(Lifecycle::Active);
      return Ok(());
    }

    if let Some(previous) = self.generations.active_version()? {
      info!(previous = %previous, "Previous version stays in control during install");
      self.controlling.store(true, Ordering::SeqCst);
    }

    if !self.install().await {
      return Ok(());
    }

    if self.config.skip_waiting {
      self.activate()?;
    }
    Ok(())
  }

  /// Install the manifest. Returns false if the install failed.
  async fn install(&self) -> bool {
    self.transition(Lifecycle::Installing);
    info!(version = %self.config.version, "Installing");

    let manifest: Result<Vec<Request>> = self
      .config
      .manifest
      .iter()
      .map(|path| self.config.resolve(path).map(Request::get))
      .collect();

    let outcome = match manifest {
      Ok(manifest) => self.generations.install(&manifest, self.fetcher.as_ref()).await,
      Err(e) => Err(e),
    };

    match outcome {
      Ok(InstallOutcome::Installed { entries }) => {
        info!(entries, "Installed successfully");
        self.transition(Lifecycle::Installed);
        true
      }
      Ok(InstallOutcome::AlreadyInstalled) => {
        self.transition(Lifecycle::Installed);
        true
      }
      Err(e) => {
        error!(error = %e, "Install failed");
        self.transition(Lifecycle::Idle);
        false
      }
    }
  }

  /// Purge stale generations and take control of traffic.
  pub fn activate(&self) -> Result<()> {
    self.transition(Lifecycle::Activating);

    match self.generations.activate() {
      Ok(purged) => {
        info!(purged = purged.len(), "Activated successfully");
        self.controlling.store(true, Ordering::SeqCst);
        self.transition(Lifecycle::Active);
        Ok(())
      }
      Err(e) => {
        self.transition(Lifecycle::Installed);
        Err(e)
      }
    }
  }

  /// Answer one intercepted request.
  pub async fn handle_fetch(&self, request: Request) -> FetchOutcome {
    if !self.controlling.load(Ordering::SeqCst) {
      return FetchOutcome::Passthrough;
    }
    self.router.handle(&request).await
  }

  /// Reconnect/background-sync trigger.
  pub async fn handle_sync(&self, tag: &str) -> Result<Option<DrainOutcome>> {
    if tag != self.config.sync.tag {
      debug!(tag, "Ignoring sync with unknown tag");
      return Ok(None);
    }
    info!(tag, pending = self.retry.len()?, "Background sync");
    self.retry.drain(self.fetcher.as_ref()).await.map(Some)
  }

  pub async fn handle_push(&self, data: Option<&str>) {
    self.notifications.on_push(data).await;
  }

  pub async fn handle_notification_click(&self, action: Option<&str>) {
    self.notifications.on_click(action).await;
  }

  pub async fn handle_message(&self, message: ControlMessage) -> Result<()> {
    info!(message = ?message, "Message received");

    match message {
      ControlMessage::SkipWaiting => match self.lifecycle() {
        Lifecycle::Installed => self.activate(),
        Lifecycle::Idle => {
          if self.install().await {
            self.activate()?;
          }
          Ok(())
        }
        state => {
          debug!(state = ?state, "Nothing to activate");
          Ok(())
        }
      },
      ControlMessage::CacheUrls { urls } => {
        let requests = urls
          .iter()
          .map(|url| self.config.resolve(url).map(Request::get))
          .collect::<Result<Vec<_>>>()?;
        let count = self
          .generations
          .preload(&requests, self.fetcher.as_ref())
          .await?;
        info!(count, "Preloaded URLs into dynamic generation");
        Ok(())
      }
      ControlMessage::ClearCache => {
        self.generations.clear_dynamic()?;
        info!("Cleared dynamic generation");
        Ok(())
      }
    }
  }

  /// Process host events until shutdown. Each event runs as its own task;
  /// fetch replies are sent on `replies` tagged with the event id.
  pub async fn run(
    self: Arc<Self>,
    mut events: mpsc::UnboundedReceiver<AgentEvent>,
    replies: mpsc::UnboundedSender<(u64, FetchOutcome)>,
  ) -> Result<()> {
    let eviction = self.eviction.clone().spawn(
      Arc::clone(&self.storage),
      self.generations.dynamic_generation().name.clone(),
      self.shutdown.subscribe(),
    );

    while let Some(event) = events.recv().await {
      let agent = Arc::clone(&self);
      match event {
        AgentEvent::Fetch { id, request } => {
          let replies = replies.clone();
          tokio::spawn(async move {
            let outcome = agent.handle_fetch(request).await;
            // The page may have gone away; nothing to compensate
            let _ = replies.send((id, outcome));
          });
        }
        AgentEvent::Sync { tag } => {
          tokio::spawn(async move {
            if let Err(e) = agent.handle_sync(&tag).await {
              error!(error = %e, "Sync failed");
            }
          });
        }
        AgentEvent::Push { data } => {
          tokio::spawn(async move { agent.handle_push(data.as_deref()).await });
        }
        AgentEvent::NotificationClick { action } => {
          tokio::spawn(async move { agent.handle_notification_click(action.as_deref()).await });
        }
        AgentEvent::Message(message) => {
          tokio::spawn(async move {
            if let Err(e) = agent.handle_message(message).await {
              warn!(error = %e, "Control message failed");
            }
          });
        }
        AgentEvent::Shutdown => break,
      }
    }

    self.shutdown();
    if let Err(e) = eviction.await {
      warn!(error = %e, "Eviction task ended abnormally");
    }
    Ok(())
  }

  /// Stop background tasks.
  pub fn shutdown(&self) {
    self.shutdown.send_replace(true);
    self.transition(Lifecycle::ShutDown);
  }
}

#[cfg(test)]
mod tests {
  use super::notify::testing::RecordingPlatform;
  use super::*;
  use crate::cache::{CacheStorage, Generation, GenerationKind, ResponseSource, RetryStore};
  use crate::config::test_config;
  use crate::net::testing::ScriptedFetcher;
  use crate::net::Response;
  use reqwest::Method;
  use std::time::Duration;

  fn serve_manifest(config: &Config, fetcher: &ScriptedFetcher) {
    for path in &config.manifest {
      let url = config.resolve(path).unwrap();
      fetcher.respond(url.as_str(), Response::new(200, path.as_bytes().to_vec()));
    }
  }

  fn agent_with(
    config: Config,
    storage: Arc<SqliteStorage>,
    fetcher: Arc<ScriptedFetcher>,
  ) -> Agent {
    Agent::new(
      config,
      storage,
      fetcher,
      Arc::new(RecordingPlatform::default()),
    )
    .unwrap()
  }

  fn get(config: &Config, path: &str) -> Request {
    Request::get(config.resolve(path).unwrap())
  }

  #[tokio::test]
  async fn test_init_installs_and_activates() {
    let config = test_config();
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let fetcher = Arc::new(ScriptedFetcher::new());
    serve_manifest(&config, &fetcher);
    storage
      .open_generation(&Generation {
        name: "learnmate-v0".to_string(),
        kind: GenerationKind::Static,
      })
      .unwrap();

    let agent = agent_with(config.clone(), Arc::clone(&storage), Arc::clone(&fetcher));
    agent.init().await.unwrap();

    assert_eq!(agent.lifecycle(), Lifecycle::Active);
    let names: Vec<String> = storage
      .generations()
      .unwrap()
      .into_iter()
      .map(|g| g.name)
      .collect();
    assert_eq!(names, vec!["learnmate-v1", "learnmate-dynamic"]);

    let before = fetcher.calls();
    let outcome = agent.handle_fetch(get(&config, "/js/quiz.js")).await;
    match outcome {
      FetchOutcome::Respond(result) => {
        assert_eq!(result.source, ResponseSource::Cache);
        assert_eq!(result.response.body, b"/js/quiz.js");
      }
      FetchOutcome::Passthrough => panic!("expected cached response"),
    }
    assert_eq!(fetcher.calls(), before);
  }

  #[tokio::test]
  async fn test_restart_same_version_skips_lifecycle() {
    let config = test_config();
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let fetcher = Arc::new(ScriptedFetcher::new());
    serve_manifest(&config, &fetcher);

    agent_with(config.clone(), Arc::clone(&storage), Arc::clone(&fetcher))
      .init()
      .await
      .unwrap();
    let calls = fetcher.calls();

    let restarted = agent_with(config, Arc::clone(&storage), Arc::clone(&fetcher));
    let mut transitions = restarted.subscribe_lifecycle();
    restarted.init().await.unwrap();

    assert_eq!(restarted.lifecycle(), Lifecycle::Active);
    assert_eq!(fetcher.calls(), calls);
    assert_eq!(storage.entries("learnmate-v1").unwrap().len(), 9);
    assert_eq!(*transitions.borrow_and_update(), Lifecycle::Active);
  }

  #[tokio::test]
  async fn test_failed_upgrade_keeps_previous_version() {
    let v1 = test_config();
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let fetcher = Arc::new(ScriptedFetcher::new());
    serve_manifest(&v1, &fetcher);
    agent_with(v1.clone(), Arc::clone(&storage), Arc::clone(&fetcher))
      .init()
      .await
      .unwrap();

    let mut v2 = v1.clone();
    v2.version = "v2".to_string();
    fetcher.fail(v2.resolve("/js/app.js").unwrap().as_str());

    let agent = agent_with(v2.clone(), Arc::clone(&storage), Arc::clone(&fetcher));
    agent.init().await.unwrap();

    assert_eq!(agent.lifecycle(), Lifecycle::Idle);
    assert!(storage.has_generation("learnmate-v1").unwrap());
    assert!(!storage.has_generation("learnmate-v2").unwrap());

    // Old generation keeps serving while the new version is not installed
    match agent.handle_fetch(get(&v2, "/js/app.js")).await {
      FetchOutcome::Respond(result) => assert_eq!(result.response.body, b"/js/app.js"),
      FetchOutcome::Passthrough => panic!("previous version should stay in control"),
    }
  }

  #[tokio::test]
  async fn test_waiting_until_skip_waiting() {
    let mut config = test_config();
    config.skip_waiting = false;
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let fetcher = Arc::new(ScriptedFetcher::new());
    serve_manifest(&config, &fetcher);

    let agent = agent_with(config.clone(), Arc::clone(&storage), Arc::clone(&fetcher));
    agent.init().await.unwrap();
    assert_eq!(agent.lifecycle(), Lifecycle::Installed);
    assert!(matches!(
      agent.handle_fetch(get(&config, "/index.html")).await,
      FetchOutcome::Passthrough
    ));

    agent.handle_message(ControlMessage::SkipWaiting).await.unwrap();
    assert_eq!(agent.lifecycle(), Lifecycle::Active);
    assert!(matches!(
      agent.handle_fetch(get(&config, "/index.html")).await,
      FetchOutcome::Respond(_)
    ));
  }

  #[tokio::test]
  async fn test_control_messages() {
    let config = test_config();
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let fetcher = Arc::new(ScriptedFetcher::new());
    serve_manifest(&config, &fetcher);
    fetcher.respond("https://app.test/lessons/1.html", Response::new(200, "l1"));

    let agent = agent_with(config, Arc::clone(&storage), Arc::clone(&fetcher));
    agent.init().await.unwrap();

    agent
      .handle_message(ControlMessage::CacheUrls {
        urls: vec!["/lessons/1.html".to_string()],
      })
      .await
      .unwrap();
    assert_eq!(storage.entries("learnmate-dynamic").unwrap().len(), 1);

    agent.handle_message(ControlMessage::ClearCache).await.unwrap();
    assert!(storage.entries("learnmate-dynamic").unwrap().is_empty());
    assert_eq!(storage.entries("learnmate-v1").unwrap().len(), 9);
  }

  #[test]
  fn test_control_message_wire_names() {
    let skip: ControlMessage = serde_json::from_str(r#"{"type":"SKIP_WAITING"}"#).unwrap();
    assert_eq!(skip, ControlMessage::SkipWaiting);

    let urls: ControlMessage =
      serde_json::from_str(r#"{"type":"CACHE_URLS","urls":["/a"]}"#).unwrap();
    assert_eq!(
      urls,
      ControlMessage::CacheUrls {
        urls: vec!["/a".to_string()]
      }
    );

    let clear: ControlMessage = serde_json::from_str(r#"{"type":"CLEAR_CACHE"}"#).unwrap();
    assert_eq!(clear, ControlMessage::ClearCache);
  }

  #[tokio::test]
  async fn test_sync_tag_filter() {
    let config = test_config();
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let fetcher = Arc::new(ScriptedFetcher::new());
    let agent = agent_with(config, Arc::clone(&storage), Arc::clone(&fetcher));

    storage
      .enqueue(&Request {
        method: Method::POST,
        url: "https://app.test/api/sync".parse().unwrap(),
        headers: Vec::new(),
        body: b"{}".to_vec(),
      })
      .unwrap();
    fetcher.respond("https://app.test/api/sync", Response::new(200, ""));

    assert_eq!(agent.handle_sync("periodic-refresh").await.unwrap(), None);
    assert_eq!(fetcher.calls(), 0);

    let outcome = agent.handle_sync("sync-progress").await.unwrap();
    assert_eq!(outcome, Some(DrainOutcome::Completed { delivered: 1 }));
  }

  #[tokio::test]
  async fn test_run_answers_fetches_and_stops() {
    let config = test_config();
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let fetcher = Arc::new(ScriptedFetcher::new());
    serve_manifest(&config, &fetcher);

    let agent = Arc::new(agent_with(config.clone(), storage, fetcher));
    agent.init().await.unwrap();

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
    let running = tokio::spawn(Arc::clone(&agent).run(event_rx, reply_tx));

    event_tx
      .send(AgentEvent::Fetch {
        id: 7,
        request: get(&config, "/index.html"),
      })
      .unwrap();
    event_tx
      .send(AgentEvent::Fetch {
        id: 8,
        request: Request::get("https://cdn.test/font.woff2".parse().unwrap()),
      })
      .unwrap();

    let mut replies = Vec::new();
    for _ in 0..2 {
      let reply = tokio::time::timeout(Duration::from_secs(1), reply_rx.recv())
        .await
        .unwrap()
        .unwrap();
      replies.push(reply);
    }
    replies.sort_by_key(|(id, _)| *id);
    assert!(matches!(replies[0], (7, FetchOutcome::Respond(_))));
    assert!(matches!(replies[1], (8, FetchOutcome::Passthrough)));

    event_tx.send(AgentEvent::Shutdown).unwrap();
    tokio::time::timeout(Duration::from_secs(1), running)
      .await
      .unwrap()
      .unwrap()
      .unwrap();
    assert_eq!(agent.lifecycle(), Lifecycle::ShutDown);
  }
}
