//! In-memory collaborators for tests and the local dev profile. The message
//! source is scripted per channel and can inject one-shot failures so callers
//! can exercise rate-limit, credential, and timeout paths without a network.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use shared::domain::{ChannelId, ExternalId};

use crate::{BlobStore, MessageSource, SourceError, SourceMessage};

#[derive(Default)]
pub struct MemoryMessageSource {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    channels: HashMap<ChannelId, BTreeMap<ExternalId, SourceMessage>>,
    payloads: HashMap<(ChannelId, ExternalId), Vec<u8>>,
    fail_next: VecDeque<SourceError>,
    download_delay: Option<Duration>,
}

impl MemoryMessageSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push_message(&self, channel: &ChannelId, message: SourceMessage) {
        let mut inner = self.inner.lock().await;
        inner
            .channels
            .entry(channel.clone())
            .or_default()
            .insert(message.id.clone(), message);
    }

    pub async fn set_media_payload(&self, channel: &ChannelId, id: &ExternalId, bytes: Vec<u8>) {
        let mut inner = self.inner.lock().await;
        inner.payloads.insert((channel.clone(), id.clone()), bytes);
    }

    /// Queue an error returned by the next source call, ahead of any data.
    pub async fn fail_next_with(&self, error: SourceError) {
        self.inner.lock().await.fail_next.push_back(error);
    }

    /// Delay applied to every download; lets tests trip the worker timeout.
    pub async fn set_download_delay(&self, delay: Duration) {
        self.inner.lock().await.download_delay = Some(delay);
    }

    async fn take_injected_failure(&self) -> Option<SourceError> {
        self.inner.lock().await.fail_next.pop_front()
    }
}

#[async_trait]
impl MessageSource for MemoryMessageSource {
    async fn fetch_forward(
        &self,
        channel: &ChannelId,
        after: Option<&ExternalId>,
        limit: usize,
    ) -> Result<Vec<SourceMessage>, SourceError> {
        if let Some(error) = self.take_injected_failure().await {
            return Err(error);
        }
        let inner = self.inner.lock().await;
        let Some(messages) = inner.channels.get(channel) else {
            return Ok(Vec::new());
        };
        Ok(messages
            .values()
            .filter(|m| after.map_or(true, |after| &m.id > after))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn fetch_backward(
        &self,
        channel: &ChannelId,
        before: &ExternalId,
        limit: usize,
    ) -> Result<Vec<SourceMessage>, SourceError> {
        if let Some(error) = self.take_injected_failure().await {
            return Err(error);
        }
        let inner = self.inner.lock().await;
        let Some(messages) = inner.channels.get(channel) else {
            return Ok(Vec::new());
        };
        Ok(messages
            .values()
            .rev()
            .filter(|m| &m.id < before)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn resolve_message(
        &self,
        channel: &ChannelId,
        id: &ExternalId,
    ) -> Result<SourceMessage, SourceError> {
        if let Some(error) = self.take_injected_failure().await {
            return Err(error);
        }
        let inner = self.inner.lock().await;
        inner
            .channels
            .get(channel)
            .and_then(|messages| messages.get(id))
            .cloned()
            .ok_or_else(|| SourceError::NotFound(format!("message {id} in channel {channel}")))
    }

    async fn download_media(
        &self,
        channel: &ChannelId,
        id: &ExternalId,
    ) -> Result<Vec<u8>, SourceError> {
        if let Some(error) = self.take_injected_failure().await {
            return Err(error);
        }
        let delay = self.inner.lock().await.download_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let inner = self.inner.lock().await;
        Ok(inner
            .payloads
            .get(&(channel.clone(), id.clone()))
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, (Vec<u8>, String)>>,
    fail_puts: Mutex<bool>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_puts(&self, fail: bool) {
        *self.fail_puts.lock().await = fail;
    }

    pub async fn len(&self) -> usize {
        self.blobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: &[u8], mime_type: &str) -> anyhow::Result<()> {
        if *self.fail_puts.lock().await {
            anyhow::bail!("blob store rejected upload for key '{key}'");
        }
        self.blobs
            .lock()
            .await
            .insert(key.to_string(), (bytes.to_vec(), mime_type.to_string()));
        Ok(())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<(Vec<u8>, String)>> {
        Ok(self.blobs.lock().await.get(key).cloned())
    }
}
