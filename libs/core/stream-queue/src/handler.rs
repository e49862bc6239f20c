//! Message handler contract.
//!
//! Business services implement `MessageHandler` (or wrap a closure with
//! [`handler_fn`]) and hand it to `StreamQueueManager::register_stream`.

use crate::error::StreamError;
use crate::message::Message;
use async_trait::async_trait;
use std::future::Future;

/// Processes messages delivered from one stream.
///
/// Return `Ok(())` to acknowledge. Any `Err` schedules a delayed retry until
/// the stream's `max_retries` is used up, after which the message is
/// dead-lettered with the error text.
///
/// # Example
///
/// ```rust,ignore
/// struct WelcomeEmail { mailer: Arc<Mailer> }
///
/// #[async_trait]
/// impl MessageHandler for WelcomeEmail {
///     async fn handle(&self, message: &Message) -> Result<(), StreamError> {
///         let signup: Signup = message.decode()?;
///         self.mailer.send_welcome(&signup.email).await
///             .map_err(|e| StreamError::handler(e.to_string()))
///     }
///
///     fn name(&self) -> &'static str {
///         "WelcomeEmail"
///     }
/// }
/// ```
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> Result<(), StreamError>;

    /// Handler name for logs and metrics.
    fn name(&self) -> &'static str {
        "handler"
    }
}

/// Closure-backed handler, see [`handler_fn`].
pub struct FnHandler<F> {
    name: &'static str,
    f: F,
}

/// Wrap an async closure as a `MessageHandler`.
///
/// The closure receives an owned copy of the message.
pub fn handler_fn<F, Fut>(name: &'static str, f: F) -> FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), StreamError>> + Send,
{
    FnHandler { name, f }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), StreamError>> + Send,
{
    async fn handle(&self, message: &Message) -> Result<(), StreamError> {
        (self.f)(message.clone()).await
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Payload;
    use chrono::Utc;

    fn message() -> Message {
        Message {
            id: "1-0".into(),
            stream: "orders".into(),
            data: Payload::new(),
            timestamp: Utc::now(),
            attempts: 1,
            last_error: None,
        }
    }

    #[tokio::test]
    async fn test_handler_fn_forwards_result() {
        let ok = handler_fn("ok", |_msg| async { Ok(()) });
        let failing = handler_fn("failing", |msg: Message| async move {
            Err(StreamError::handler(format!("cannot process {}", msg.id)))
        });

        assert_eq!(ok.name(), "ok");
        assert!(ok.handle(&message()).await.is_ok());

        let err = failing.handle(&message()).await.unwrap_err();
        assert_eq!(err.to_string(), "cannot process 1-0");
    }
}
