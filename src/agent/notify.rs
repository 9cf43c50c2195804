//! Push notifications and the user's response to them.

use async_trait::async_trait;
use chrono::Utc;
use color_eyre::Result;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::NotificationConfig;

/// Action id that opens the app.
pub const ACTION_EXPLORE: &str = "explore";
/// Action id that only dismisses.
pub const ACTION_CLOSE: &str = "close";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
  pub data: NotificationData,
  pub actions: Vec<NotificationAction>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NotificationData {
  /// Unix millis
  pub date_of_arrival: i64,
  pub primary_key: u32,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
  pub icon: String,
}

/// Host platform calls the dispatcher needs.
#[async_trait]
pub trait Platform: Send + Sync {
  async fn show_notification(&self, notification: &Notification) -> Result<()>;

  async fn close_notification(&self) -> Result<()>;

  /// Focus the app window if open, otherwise open one.
  async fn open_window(&self, url: &Url) -> Result<()>;
}

/// What a click on the alert resulted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClickOutcome {
  OpenedWindow,
  Dismissed,
}

pub struct NotificationDispatcher {
  config: NotificationConfig,
  app_url: Url,
  platform: Arc<dyn Platform>,
}

impl NotificationDispatcher {
  pub fn new(config: NotificationConfig, app_url: Url, platform: Arc<dyn Platform>) -> Self {
    Self {
      config,
      app_url,
      platform,
    }
  }

  /// Build the alert for a push payload.
  pub fn build(&self, payload: Option<&str>) -> Notification {
    let body = payload
      .filter(|p| !p.is_empty())
      .unwrap_or(self.config.default_body.as_str());

    Notification {
      title: self.config.title.clone(),
      body: body.to_string(),
      icon: self.config.icon.clone(),
      badge: self.config.badge.clone(),
      vibrate: self.config.vibrate.clone(),
      data: NotificationData {
        date_of_arrival: Utc::now().timestamp_millis(),
        primary_key: 1,
      },
      actions: vec![
        NotificationAction {
          action: ACTION_EXPLORE.to_string(),
          title: "View".to_string(),
          icon: "/assets/images/checkmark.png".to_string(),
        },
        NotificationAction {
          action: ACTION_CLOSE.to_string(),
          title: "Close".to_string(),
          icon: "/assets/images/xmark.png".to_string(),
        },
      ],
    }
  }

  /// Show an alert for an inbound push. Failures are logged and dropped.
  pub async fn on_push(&self, payload: Option<&str>) {
    info!("Push notification received");
    let notification = self.build(payload);

    if let Err(e) = self.platform.show_notification(&notification).await {
      warn!(error = %e, "Failed to show notification");
    }
  }

  /// Handle a click on the alert. The alert is always closed; only the
  /// primary action opens the app.
  pub async fn on_click(&self, action: Option<&str>) -> ClickOutcome {
    debug!(action = ?action, "Notification clicked");

    if let Err(e) = self.platform.close_notification().await {
      warn!(error = %e, "Failed to close notification");
    }

    if action != Some(ACTION_EXPLORE) {
      return ClickOutcome::Dismissed;
    }

    if let Err(e) = self.platform.open_window(&self.app_url).await {
      warn!(url = %self.app_url, error = %e, "Failed to open app window");
    }
    ClickOutcome::OpenedWindow
  }
}
