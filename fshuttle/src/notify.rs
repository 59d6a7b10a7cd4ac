use crate::errors::Result;
use crate::models::IntegrationReport;
use serde::Serialize;
use url::Url;

/// Body posted to the notification webhook when a run ends.
#[derive(Debug, Serialize)]
pub struct RunNotification<'a> {
    pub plan: &'a str,
    pub succeeded: bool,
    pub report: Option<&'a IntegrationReport>,
    pub error: Option<String>,
}

impl<'a> RunNotification<'a> {
    pub fn from_result(plan: &'a str, result: &'a Result<IntegrationReport>) -> Self {
        match result {
            Ok(report) => Self {
                plan,
                succeeded: true,
                report: Some(report),
                error: None,
            },
            Err(e) => Self {
                plan,
                succeeded: false,
                report: None,
                error: Some(e.to_string()),
            },
        }
    }
}

pub struct WebhookNotifier {
    url: Url,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }

    /// Best effort: failures are logged and never reach the caller.
    pub async fn notify(&self, notification: &RunNotification<'_>) {
        match self.client.post(self.url.clone()).json(notification).send().await {
            Ok(response) if response.status().is_success() => {
                log::debug!("Notified {} about plan '{}'", self.url, notification.plan);
            }
            Ok(response) => {
                log::warn!(
                    "Notification webhook {} answered {}",
                    self.url,
                    response.status()
                );
            }
            Err(e) => log::warn!("Notification webhook {} failed: {}", self.url, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ShuttleError;

    #[test]
    fn test_notification_body() {
        let failed: Result<IntegrationReport> = Err(ShuttleError::Source("disk gone".into()));
        let body = serde_json::to_value(RunNotification::from_result("cars", &failed)).unwrap();
        assert_eq!(body["succeeded"], false);
        assert_eq!(body["error"], "Row source failed: disk gone");
        assert!(body["report"].is_null());

        let ok: Result<IntegrationReport> = Ok(IntegrationReport {
            plan: "cars".into(),
            rows_read: 2,
            ..Default::default()
        });
        let body = serde_json::to_value(RunNotification::from_result("cars", &ok)).unwrap();
        assert_eq!(body["report"]["rows_read"], 2);
    }

    #[tokio::test]
    async fn test_unreachable_webhook_is_not_an_error() {
        let notifier = WebhookNotifier::new(Url::parse("http://127.0.0.1:9/hook").unwrap());
        let ok: Result<IntegrationReport> = Ok(IntegrationReport::default());
        notifier
            .notify(&RunNotification::from_result("cars", &ok))
            .await;
    }
}
