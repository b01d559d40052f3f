//! Security scanning: ask the Trivy proxy for a vulnerability report on each
//! due manifest and record the resulting status. Manifest lists aggregate
//! the worst status of their children.

use serde::Deserialize;
use tracing::debug;

use super::{Janitor, JobResult, SECURITY_SCAN_INTERVAL_SECS};
use crate::auth::token::SCANNER_EXPIRES_IN_SECS;
use crate::auth::{Audience, Authorization, Scope, ScopeSet};
use crate::db::{VULN_STATUS_ERROR, VULN_STATUS_PENDING};
use crate::drivers::auth::PeerIdentity;
use crate::errors::RegistryV2Error;

/// Vulnerability statuses, ordered from best to worst so that `max` picks the
/// worst child status for manifest lists.
const STATUS_ORDER: &[&str] = &["Clean", "Unknown", "Low", "Medium", "High", "Critical"];

fn severity_rank(status: &str) -> usize {
    STATUS_ORDER.iter().position(|s| *s == status).unwrap_or(0)
}

#[derive(sqlx::FromRow)]
struct ScanCandidate {
    repo_id: i64,
    digest: String,
    account_name: String,
    repo_name: String,
}

#[derive(Deserialize)]
struct TrivyReport {
    #[serde(default, rename = "Results")]
    results: Vec<TrivyResult>,
}

#[derive(Deserialize)]
struct TrivyResult {
    #[serde(default, rename = "Vulnerabilities")]
    vulnerabilities: Vec<TrivyVulnerability>,
}

#[derive(Deserialize)]
struct TrivyVulnerability {
    #[serde(default, rename = "Severity")]
    severity: String,
}

impl Janitor {
    pub(crate) async fn check_next_security_status(&self) -> Result<JobResult, RegistryV2Error> {
        let candidate: Option<ScanCandidate> = sqlx::query_as(
            "SELECT si.repo_id AS repo_id, si.digest AS digest,
                    r.account_name AS account_name, r.name AS repo_name
               FROM security_info si JOIN repos r ON si.repo_id = r.id
              WHERE si.next_check_at < $1
              ORDER BY si.next_check_at ASC
              LIMIT 1",
        )
        .bind(self.now())
        .fetch_optional(&self.db)
        .await?;
        let Some(candidate) = candidate else {
            return Ok(JobResult::NothingToDo);
        };

        let (status, message) = self.determine_vuln_status(&candidate).await;
        sqlx::query(
            "UPDATE security_info SET vuln_status = $1, message = $2, checked_at = $3, next_check_at = $4
              WHERE repo_id = $5 AND digest = $6",
        )
        .bind(&status)
        .bind(&message)
        .bind(self.now())
        .bind(self.next_run(SECURITY_SCAN_INTERVAL_SECS))
        .bind(candidate.repo_id)
        .bind(&candidate.digest)
        .execute(&self.db)
        .await?;

        Ok(JobResult::DidWork)
    }

    async fn determine_vuln_status(&self, candidate: &ScanCandidate) -> (String, String) {
        // a manifest with children reports the worst status of its children;
        // children that have not been scanned yet keep the parent pending
        let children: Vec<(String,)> = match sqlx::query_as(
            "SELECT child_digest FROM manifest_manifest_refs WHERE repo_id = $1 AND parent_digest = $2",
        )
        .bind(candidate.repo_id)
        .bind(&candidate.digest)
        .fetch_all(&self.db)
        .await
        {
            Ok(children) => children,
            Err(err) => return (VULN_STATUS_ERROR.into(), err.to_string()),
        };

        if !children.is_empty() {
            let mut worst = "Clean".to_string();
            for (child_digest,) in children {
                let child_status: Option<(String,)> = sqlx::query_as(
                    "SELECT vuln_status FROM security_info WHERE repo_id = $1 AND digest = $2",
                )
                .bind(candidate.repo_id)
                .bind(&child_digest)
                .fetch_optional(&self.db)
                .await
                .unwrap_or(None);
                let child_status = child_status.map(|(s,)| s).unwrap_or_else(|| VULN_STATUS_PENDING.into());
                if child_status == VULN_STATUS_PENDING || child_status == VULN_STATUS_ERROR {
                    return (VULN_STATUS_PENDING.into(), String::new());
                }
                if severity_rank(&child_status) > severity_rank(&worst) {
                    worst = child_status;
                }
            }
            return (worst, String::new());
        }

        let Some(trivy_url) = &self.config.trivy_url else {
            return ("Unsupported".into(), "no security scanner is configured".into());
        };

        match self.fetch_trivy_report(trivy_url, candidate).await {
            Ok(report) => {
                let mut worst = "Clean".to_string();
                for result in &report.results {
                    for vulnerability in &result.vulnerabilities {
                        let severity = normalize_severity(&vulnerability.severity);
                        if severity_rank(severity) > severity_rank(&worst) {
                            worst = severity.to_string();
                        }
                    }
                }
                (worst, String::new())
            }
            Err(err) => {
                debug!("security scan of {} failed: {err}", candidate.digest);
                (VULN_STATUS_ERROR.into(), err.to_string())
            }
        }
    }

    async fn fetch_trivy_report(
        &self,
        trivy_url: &str,
        candidate: &ScanCandidate,
    ) -> Result<TrivyReport, RegistryV2Error> {
        // a short-lived pull token lets the scanner fetch the image from us
        let mut scope_set = ScopeSet::default();
        scope_set.add(Scope::repository(
            &format!("{}/{}", candidate.account_name, candidate.repo_name),
            &["pull"],
        ));
        let authorization = Authorization {
            user_identity: std::sync::Arc::new(PeerIdentity {
                peer_hostname: self.config.api_public_hostname.clone(),
            }),
            scope_set,
            audience: Audience::default(),
        };
        let token = authorization
            .issue_token_with_expiry(&self.config, SCANNER_EXPIRES_IN_SECS)?
            .token;

        let image = format!(
            "{}/{}/{}@{}",
            self.config.api_public_hostname, candidate.account_name, candidate.repo_name, candidate.digest
        );
        let client = reqwest::Client::new();
        let response = client
            .get(format!("{}/trivy", trivy_url.trim_end_matches('/')))
            .query(&[("image", image.as_str()), ("format", "json")])
            .header("X-Keppel-Token", token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(RegistryV2Error::Internal(format!(
                "scanner returned {}",
                response.status()
            )));
        }
        let raw_report = response.bytes().await?;

        // keep the raw report next to the manifest for the report endpoints
        self.sd
            .write_scan_report(&candidate.account_name, &candidate.repo_name, &candidate.digest, "json", &raw_report)
            .await
            .map_err(|err| RegistryV2Error::Internal(err.to_string()))?;

        Ok(serde_json::from_slice(&raw_report)?)
    }
}

fn normalize_severity(severity: &str) -> &'static str {
    match severity.to_ascii_uppercase().as_str() {
        "LOW" => "Low",
        "MEDIUM" => "Medium",
        "HIGH" => "High",
        "CRITICAL" => "Critical",
        "UNKNOWN" => "Unknown",
        _ => "Unknown",
    }
}
