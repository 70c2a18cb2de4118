//! Caller-side handle of one generation

use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use super::engine::TextFragment;
use crate::error::GenerationError;

pub type FragmentResult = Result<TextFragment, GenerationError>;

/// Fragments in order, ending either when the generation completes or with
/// exactly one `Err` item.
pub struct FragmentStream {
    id: Uuid,
    inner: UnboundedReceiverStream<FragmentResult>,
}

impl FragmentStream {
    pub(crate) fn new(id: Uuid, receiver: mpsc::UnboundedReceiver<FragmentResult>) -> Self {
        Self {
            id,
            inner: UnboundedReceiverStream::new(receiver),
        }
    }

    /// A stream whose only item is `error`.
    pub fn failed(error: GenerationError) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(Err(error));
        Self::new(Uuid::new_v4(), rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Drain the stream into one string.
    pub async fn collect_text(mut self) -> Result<String, GenerationError> {
        let mut text = String::new();
        while let Some(item) = self.next().await {
            text.push_str(&item?.text);
        }
        Ok(text)
    }
}

impl Stream for FragmentStream {
    type Item = FragmentResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
