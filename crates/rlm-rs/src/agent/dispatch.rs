//! One model call: timeout, retry and fallback.
//!
//! Each attempt is bounded by `call_timeout`. Transient failures are retried
//! on the same model with [`RetryConfig`](crate::api::retry::RetryConfig)
//! backoff; once a model gives up, the next model in the fallback chain
//! takes over. Only when every model has failed does the caller see a
//! [`RunError::TransportFault`].

use crate::agent::config::RlmConfig;
use crate::agent::events::{EventHandler, RunEvent};
use crate::api::retry::retry_call;
use crate::error::RunError;
use crate::{Completion, CompletionOptions, Message, ModelClient};
use tracing::debug;

/// A successful completion and the model that produced it.
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub completion: Completion,
    pub model: String,
}

/// Send `messages` to the model chain for `depth` and return the first
/// successful completion.
pub async fn dispatch(
    client: &dyn ModelClient,
    messages: &[Message],
    config: &RlmConfig,
    depth: u32,
    events: &dyn EventHandler,
) -> Result<Dispatched, RunError> {
    let route = config.route();
    let chain = route.chain_for_depth(depth);
    let mut last_error = String::new();

    for (i, model) in chain.iter().enumerate() {
        let options = CompletionOptions {
            model: model.to_string(),
            temperature: config.temperature,
            timeout: config.call_timeout,
            max_tokens: config.max_tokens,
        };
        debug!(
            "[depth {depth}] dispatching {} message(s) to {model}",
            messages.len()
        );

        let result = retry_call(&config.retry, model, || {
            let call = client.complete(messages, &options);
            let timeout = options.timeout;
            async move {
                match tokio::time::timeout(timeout, call).await {
                    Ok(result) => result,
                    Err(_) => Err(format!("request timed out after {timeout:?}")),
                }
            }
        })
        .await;

        match result {
            Ok(completion) => {
                return Ok(Dispatched {
                    completion,
                    model: model.to_string(),
                });
            }
            Err(error) => {
                if let Some(next) = chain.get(i + 1) {
                    events.on_event(&RunEvent::ModelFallback {
                        depth,
                        from: model.to_string(),
                        to: next.to_string(),
                        error: error.clone(),
                    });
                }
                last_error = error;
            }
        }
    }

    Err(RunError::TransportFault {
        model: chain.last().map(|m| m.to_string()).unwrap_or_default(),
        message: last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::events::{FnEventHandler, NoopHandler};
    use crate::{CompletionFuture, FnModelClient};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn fast_retry(config: RlmConfig, retries: u32) -> RlmConfig {
        let mut config = config.with_retries(retries);
        config.retry.initial_delay = Duration::from_millis(1);
        config.retry.max_delay = Duration::from_millis(2);
        config
    }

    #[tokio::test]
    async fn returns_first_success() {
        let client = FnModelClient::new(|_, options| Ok(Completion::new(options.model.clone(), 3, 4)));
        let config = RlmConfig::new("primary");
        let out = dispatch(&client, &[Message::user("q")], &config, 0, &NoopHandler)
            .await
            .unwrap();
        assert_eq!(out.model, "primary");
        assert_eq!(out.completion.content, "primary");
    }

    #[tokio::test]
    async fn uses_recursive_model_below_root() {
        let client = FnModelClient::new(|_, options| Ok(Completion::new(options.model.clone(), 0, 0)));
        let config = RlmConfig::new("big").with_recursive_model("small");
        let out = dispatch(&client, &[], &config, 2, &NoopHandler).await.unwrap();
        assert_eq!(out.model, "small");
    }

    #[tokio::test]
    async fn retries_transient_errors_on_same_model() {
        let attempts = Arc::new(Mutex::new(0));
        let counter = attempts.clone();
        let client = FnModelClient::new(move |_, _| {
            let mut n = counter.lock().unwrap();
            *n += 1;
            if *n < 3 {
                Err("OpenRouter API HTTP 503: overloaded".to_string())
            } else {
                Ok(Completion::new("ok", 0, 0))
            }
        });
        let config = fast_retry(RlmConfig::new("m"), 2);
        let out = dispatch(&client, &[], &config, 0, &NoopHandler).await.unwrap();
        assert_eq!(out.completion.content, "ok");
        assert_eq!(*attempts.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn falls_back_and_emits_event() {
        let client = FnModelClient::new(|_, options| {
            if options.model == "primary" {
                Err("OpenRouter API HTTP 401: unauthorized".to_string())
            } else {
                Ok(Completion::new(options.model.clone(), 0, 0))
            }
        });
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = FnEventHandler::new(move |e: &RunEvent| sink.lock().unwrap().push(e.clone()));
        let config = RlmConfig::new("primary").with_fallback_models(vec!["backup".into()]);

        let out = dispatch(&client, &[], &config, 0, &handler).await.unwrap();
        assert_eq!(out.model, "backup");
        let events = seen.lock().unwrap();
        assert!(matches!(
            &events[..],
            [RunEvent::ModelFallback { from, to, .. }] if from == "primary" && to == "backup"
        ));
    }

    #[tokio::test]
    async fn transport_fault_names_last_model() {
        let client = FnModelClient::new(|_, options| Err(format!("HTTP 400 from {}", options.model)));
        let config = RlmConfig::new("a").with_fallback_models(vec!["b".into()]);
        let err = dispatch(&client, &[], &config, 0, &NoopHandler)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RunError::TransportFault {
                model: "b".into(),
                message: "HTTP 400 from b".into(),
            }
        );
    }

    struct Hanging;

    impl ModelClient for Hanging {
        fn complete<'a>(
            &'a self,
            _messages: &'a [Message],
            _options: &'a CompletionOptions,
        ) -> CompletionFuture<'a> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Completion::default())
            })
        }
    }

    #[tokio::test]
    async fn call_timeout_is_a_transport_fault() {
        let config = RlmConfig::new("slow").with_call_timeout(Duration::from_millis(20));
        let err = dispatch(&Hanging, &[], &config, 0, &NoopHandler)
            .await
            .unwrap_err();
        match err {
            RunError::TransportFault { message, .. } => assert!(message.contains("timed out")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
