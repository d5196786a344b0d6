//! GitHub REST client for opening pull requests.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::{ClientError, CodeHost, PullRequestDraft};

const USER_AGENT: &str = "pr-pipeline";

pub struct GitHubClient {
    http: reqwest::Client,
    api_base: String,
    token: String,
}

impl GitHubClient {
    pub fn new(api_base: &str, token: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            token,
        }
    }

    async fn post<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<reqwest::Response, ClientError> {
        let response = self
            .http
            .post(format!("{}{}", self.api_base, path))
            .header("User-Agent", USER_AGENT)
            .header("Accept", "application/vnd.github+json")
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let remaining = response
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, remaining.as_deref(), &body))
    }

    /// Reviewers and labels are a courtesy: failures are logged only.
    async fn decorate(&self, draft: &PullRequestDraft, number: u64) {
        let repo = &draft.repo;

        if !draft.reviewers.is_empty() {
            let (teams, users): (Vec<&String>, Vec<&String>) =
                draft.reviewers.iter().partition(|r| r.contains('/'));
            let request = ReviewersRequest {
                reviewers: users.into_iter().cloned().collect(),
                team_reviewers: teams
                    .into_iter()
                    .filter_map(|t| t.split_once('/').map(|(_, team)| team.to_string()))
                    .collect(),
            };
            let path = format!(
                "/repos/{}/{}/pulls/{number}/requested_reviewers",
                repo.owner, repo.name
            );
            if let Err(e) = self.post(&path, &request).await {
                warn!(pr = number, error = %e, "failed to request reviewers");
            }
        }

        if !draft.labels.is_empty() {
            let path = format!("/repos/{}/{}/issues/{number}/labels", repo.owner, repo.name);
            let request = LabelsRequest {
                labels: &draft.labels,
            };
            if let Err(e) = self.post(&path, &request).await {
                warn!(pr = number, error = %e, "failed to add labels");
            }
        }
    }
}

#[derive(Serialize)]
struct CreatePullRequest<'a> {
    title: &'a str,
    head: &'a str,
    base: &'a str,
    body: &'a str,
    draft: bool,
}

#[derive(Serialize)]
struct ReviewersRequest {
    reviewers: Vec<String>,
    team_reviewers: Vec<String>,
}

#[derive(Serialize)]
struct LabelsRequest<'a> {
    labels: &'a [String],
}

#[derive(Deserialize)]
struct PullResponse {
    number: u64,
    html_url: String,
}

#[async_trait]
impl CodeHost for GitHubClient {
    #[instrument(skip(self, draft), fields(repo = %draft.repo, head = %draft.head, base = %draft.base))]
    async fn create_pull_request(&self, draft: &PullRequestDraft) -> Result<String, ClientError> {
        let path = format!("/repos/{}/{}/pulls", draft.repo.owner, draft.repo.name);
        let request = CreatePullRequest {
            title: &draft.title,
            head: &draft.head,
            base: &draft.base,
            body: &draft.body,
            draft: draft.draft,
        };

        debug!("creating pull request");
        let created = self
            .post(&path, &request)
            .await?
            .json::<PullResponse>()
            .await
            .map_err(|e| ClientError::Rejected(format!("unexpected pull request response: {e}")))?;
        debug!(number = created.number, url = %created.html_url, "pull request created");

        self.decorate(draft, created.number).await;
        Ok(created.html_url)
    }
}

fn classify_transport(error: reqwest::Error) -> ClientError {
    if error.is_timeout() || error.is_connect() || error.is_request() {
        ClientError::Transient(error.to_string())
    } else {
        ClientError::Rejected(error.to_string())
    }
}

/// Map a GitHub error response onto the collaborator taxonomy.
fn classify_status(status: StatusCode, ratelimit_remaining: Option<&str>, body: &str) -> ClientError {
    let message = format!("{status}: {}", body.trim());
    match status {
        StatusCode::TOO_MANY_REQUESTS => ClientError::RateLimited(message),
        StatusCode::FORBIDDEN if ratelimit_remaining == Some("0") => {
            ClientError::RateLimited(message)
        }
        StatusCode::UNAUTHORIZED => ClientError::Auth(message),
        StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => ClientError::Permission(message),
        s if s.is_server_error() => ClientError::Transient(message),
        _ => ClientError::Rejected(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, None, ""),
            ClientError::RateLimited(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, Some("0"), "API rate limit exceeded"),
            ClientError::RateLimited(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, Some("4999"), "Resource not accessible"),
            ClientError::Permission(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, None, "Bad credentials"),
            ClientError::Auth(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, None, ""),
            ClientError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY, None, "A pull request already exists"),
            ClientError::Rejected(_)
        ));
    }

    #[test]
    fn test_api_base_trailing_slash() {
        let client = GitHubClient::new("https://api.github.com/", "t".to_string());
        assert_eq!(client.api_base, "https://api.github.com");
    }

    #[tokio::test]
    async fn test_unreachable_api_is_transient() {
        let client = GitHubClient::new("http://127.0.0.1:9", "t".to_string());
        let draft = PullRequestDraft {
            repo: crate::requirement::RepoSlug {
                owner: "acme".to_string(),
                name: "service".to_string(),
            },
            base: "main".to_string(),
            head: "feature/r1".to_string(),
            title: "r1: test".to_string(),
            body: String::new(),
            labels: vec![],
            reviewers: vec![],
            draft: false,
        };
        let err = client.create_pull_request(&draft).await.unwrap_err();
        assert!(err.is_retryable(), "{err}");
    }
}
