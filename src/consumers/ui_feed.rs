//! Read-only feed of gate decisions and their results for a UI.

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::core::dispatch::{Handler, HandlerError};
use crate::domain::{Record, RecordKind};

/// Writes every suggestion, action and action result as one JSON line
pub struct UiFeed<W> {
    out: W,
}

impl<W> UiFeed<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

#[async_trait]
impl<W> Handler for UiFeed<W>
where
    W: AsyncWrite + Unpin + Send,
{
    fn accepts(&self, kind: RecordKind) -> bool {
        matches!(
            kind,
            RecordKind::Suggestion | RecordKind::Action | RecordKind::ActionResult
        )
    }

    async fn handle(&mut self, record: &Record) -> Result<(), HandlerError> {
        let mut line = serde_json::to_vec(record).map_err(anyhow::Error::from)?;
        line.push(b'\n');
        self.out.write_all(&line).await.map_err(anyhow::Error::from)?;
        self.out.flush().await.map_err(anyhow::Error::from)?;
        Ok(())
    }
}
