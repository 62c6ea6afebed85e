//! Outbound calls to other nodes.

use crate::{
    node::Config,
    wire::{self, ERROR_PREFIX},
    Address, CommitteeId, Error, Transaction,
};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// HTTP client speaking the node wire contract.
#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    notify_attempts: usize,
    notify_delay: Duration,

    /// Timeout of a validator change, which the remote node may retry before answering.
    validator_timeout: Duration,
}

/// Turn an `ERROR: {msg}` body into [Error::Remote].
fn check(body: String) -> Result<String, Error> {
    match body.strip_prefix(ERROR_PREFIX) {
        Some(msg) => Err(Error::Remote(msg.to_string())),
        None => Ok(body),
    }
}

fn url(host: &Address, path: &str) -> String {
    format!("http://{host}{path}")
}

/// Upper bound on how long a node takes to answer a validator change: every update attempt
/// running to its deadline, plus one ordinary request.
fn validator_timeout(config: &Config) -> Duration {
    let attempts = u32::try_from(config.update_attempts.max(1)).unwrap_or(u32::MAX);
    config
        .update_timeout
        .saturating_mul(attempts)
        .saturating_add(config.request_timeout)
}

async fn send(request: reqwest::RequestBuilder) -> Result<String, Error> {
    let body = request.send().await?.text().await?;
    check(body)
}

impl Client {
    pub fn new(config: &Config) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            http,
            notify_attempts: config.notify_attempts.max(1),
            notify_delay: config.notify_delay,
            validator_timeout: validator_timeout(config),
        })
    }

    /// `GET` returning the raw body.
    pub async fn get_text(&self, host: &Address, path: &str) -> Result<String, Error> {
        send(self.http.get(url(host, path))).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, host: &Address, path: &str) -> Result<T, Error> {
        let body = self.get_text(host, path).await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// `POST` a JSON body, returning the raw body.
    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        host: &Address,
        path: &str,
        body: &B,
    ) -> Result<String, Error> {
        send(self.http.post(url(host, path)).json(body)).await
    }

    /// `POST` a JSON body and return whatever the host answers, error markers included.
    pub async fn forward<B: Serialize + ?Sized>(
        &self,
        host: &Address,
        path: &str,
        body: &B,
    ) -> Result<String, Error> {
        Ok(self
            .http
            .post(url(host, path))
            .json(body)
            .send()
            .await?
            .text()
            .await?)
    }

    /// `POST` a notification, retrying with a fixed delay.
    ///
    /// A host that answers with an error marker is not retried.
    pub async fn notify<B: Serialize + ?Sized>(
        &self,
        host: &Address,
        path: &str,
        body: &B,
    ) -> Result<(), Error> {
        for attempt in 1..=self.notify_attempts {
            match self.post_json(host, path, body).await {
                Ok(_) => return Ok(()),
                Err(Error::Http(err)) => {
                    debug!(%host, path, attempt, ?err, "notification failed");
                }
                Err(err) => return Err(err),
            }
            if attempt < self.notify_attempts {
                sleep(self.notify_delay).await;
            }
        }
        warn!(%host, path, attempts = self.notify_attempts, "notification unreachable");
        Err(Error::NotificationUnreachable(host.to_string()))
    }

    pub async fn start(&self, host: &Address, a: &CommitteeId, b: &CommitteeId) -> Result<(), Error> {
        self.get_text(host, &format!("/start/{a}/{b}")).await?;
        Ok(())
    }

    pub async fn genesis(&self, host: &Address, id: &CommitteeId, body: &wire::Genesis) -> Result<(), Error> {
        self.post_json(host, &format!("/genesis/{id}"), body).await?;
        Ok(())
    }

    pub async fn join(&self, host: &Address, id: &CommitteeId, body: &wire::Neighbours) -> Result<(), Error> {
        self.post_json(host, &format!("/join/{id}"), body).await?;
        Ok(())
    }

    pub async fn add(&self, host: &Address, id: &CommitteeId, body: &wire::Neighbours) -> Result<(), Error> {
        self.post_json(host, &format!("/add/{id}"), body).await?;
        Ok(())
    }

    pub async fn info(&self, host: &Address, id: Option<&CommitteeId>) -> Result<wire::Info, Error> {
        match id {
            Some(id) => self.get_json(host, &format!("/info/{id}")).await,
            None => self.get_json(host, "/info").await,
        }
    }

    pub async fn quorum_info(
        &self,
        host: &Address,
        id: Option<&CommitteeId>,
        include_self: bool,
    ) -> Result<wire::QuorumInfo, Error> {
        let path = match id {
            Some(id) => format!("/quorum+info/{id}?include_self={include_self}"),
            None => format!("/quorum+info?include_self={include_self}"),
        };
        self.get_json(host, &path).await
    }

    pub async fn intersection_map(&self, host: &Address) -> Result<wire::IntersectionTable, Error> {
        self.get_json(host, "/intersection+map").await
    }

    pub async fn min_intersection(&self, host: &Address) -> Result<wire::Selection, Error> {
        self.get_json(host, "/min+intersection").await
    }

    pub async fn max_intersection(&self, host: &Address) -> Result<wire::Selection, Error> {
        self.get_json(host, "/max+intersection").await
    }

    pub async fn val_key(&self, host: &Address, id: &CommitteeId) -> Result<String, Error> {
        self.get_text(host, &format!("/val+key/{id}")).await
    }

    pub async fn user_key(&self, host: &Address, id: &CommitteeId) -> Result<String, Error> {
        self.get_text(host, &format!("/user+key/{id}")).await
    }

    /// Consensus endpoint of the host's node for `id`.
    pub async fn ip(&self, host: &Address, id: &CommitteeId) -> Result<String, Error> {
        self.get_text(host, &format!("/ip/{id}")).await
    }

    pub async fn committee_val_keys(&self, host: &Address, id: &CommitteeId) -> Result<Vec<String>, Error> {
        self.get_json(host, &format!("/committee+val+keys/{id}")).await
    }

    pub async fn committee_ips(&self, host: &Address, id: &CommitteeId) -> Result<Vec<String>, Error> {
        self.get_json(host, &format!("/committee+ips/{id}")).await
    }

    pub async fn add_host(&self, host: &Address, notice: &wire::HostNotice) -> Result<(), Error> {
        self.notify(host, "/add+host", notice).await
    }

    pub async fn remove_host(&self, host: &Address, notice: &wire::HostNotice) -> Result<(), Error> {
        self.notify(host, "/remove+host", notice).await
    }

    pub async fn add_validator(&self, host: &Address, notice: &wire::ValidatorNotice) -> Result<(), Error> {
        self.change_validator(host, "/add+validator", notice).await
    }

    pub async fn remove_validator(&self, host: &Address, notice: &wire::ValidatorNotice) -> Result<(), Error> {
        self.change_validator(host, "/remove+validator", notice).await
    }

    /// `POST` a validator change and wait for the remote node to finish its own retries.
    ///
    /// Running out of time is reported as [Error::MembershipUpdateTimeout]: the change may
    /// still be pending on the remote node and must not be treated as confirmed.
    async fn change_validator(
        &self,
        host: &Address,
        path: &str,
        notice: &wire::ValidatorNotice,
    ) -> Result<(), Error> {
        let request = self
            .http
            .post(url(host, path))
            .json(notice)
            .timeout(self.validator_timeout);
        match send(request).await {
            Ok(_) => Ok(()),
            Err(Error::Http(err)) if err.is_timeout() => {
                warn!(%host, path, committee = %notice.quorum_id, "validator change timed out");
                Err(Error::MembershipUpdateTimeout(notice.quorum_id.clone()))
            }
            Err(err) => Err(err),
        }
    }

    pub async fn request_join(&self, host: &Address, known_host: &Address) -> Result<(), Error> {
        let body = wire::JoinRequest {
            known_host: known_host.clone(),
        };
        self.post_json(host, "/request+join", &body).await?;
        Ok(())
    }

    pub async fn request_leave(&self, host: &Address) -> Result<(), Error> {
        self.post_json(host, "/request+leave", &()).await?;
        Ok(())
    }

    pub async fn vacate(&self, host: &Address, id: &CommitteeId) -> Result<wire::Vacated, Error> {
        let body = self.post_json(host, &format!("/vacate/{id}"), &()).await?;
        Ok(serde_json::from_str(&body)?)
    }

    pub async fn refresh(&self, host: &Address) -> Result<(), Error> {
        self.post_json(host, "/refresh", &()).await?;
        Ok(())
    }

    pub async fn status(&self, host: &Address) -> Result<String, Error> {
        self.get_text(host, "/status").await
    }

    pub async fn submit(&self, host: &Address, tx: &Transaction) -> Result<(), Error> {
        self.post_json(host, "/submit", tx).await?;
        Ok(())
    }

    pub async fn get(&self, host: &Address, tx: &Transaction) -> Result<String, Error> {
        self.post_json(host, "/get", tx).await
    }

    pub async fn blocks(&self, host: &Address, tx: &Transaction) -> Result<u64, Error> {
        let body = self.post_json(host, "/blocks", tx).await?;
        body.trim()
            .parse()
            .map_err(|_| Error::Remote(format!("invalid block count: {body}")))
    }
}
