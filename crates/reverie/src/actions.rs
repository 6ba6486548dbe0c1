//! The fluent operation surface.
//!
//! Every method here enqueues one action and returns `&Self`, so a
//! whole interaction reads as a chain ending in
//! [`run`](crate::Reverie::run). Page-touching operations come in two
//! flavors: evaluations of a page-side script through the instance
//! bridge, and named calls the worker implements natively (typing,
//! cookies, screenshots).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast;

use crate::controller::{evaluate_now, lock, require_channel, Reverie};
use crate::error::ControlError;
use crate::script;
use crate::wait::{self, WaitSettings};

/// What kind of source [`Reverie::inject`] is loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectKind {
    Js,
    Css,
}

impl Reverie {
    /// Set a default header sent with every subsequent navigation.
    /// Takes effect immediately, not through the queue.
    pub fn header(&self, name: impl Into<String>, value: impl Into<String>) -> &Self {
        lock(&self.inner.headers).insert(name.into(), value.into());
        self
    }

    /// Navigate to `url` with the instance's default headers.
    pub fn goto(&self, url: impl Into<String>) -> &Self {
        self.goto_with_headers(url, Vec::new())
    }

    /// Navigate with extra headers. Instance defaults fill in anything
    /// the caller did not set; both are captured at queue time.
    pub fn goto_with_headers(
        &self,
        url: impl Into<String>,
        headers: Vec<(String, String)>,
    ) -> &Self {
        let url = url.into();
        let mut merged: serde_json::Map<String, Value> = headers
            .into_iter()
            .map(|(k, v)| (k, Value::from(v)))
            .collect();
        for (name, value) in lock(&self.inner.headers).iter() {
            merged
                .entry(name.clone())
                .or_insert_with(|| Value::from(value.clone()));
        }
        self.queue_action("goto", move |inner| {
            Box::pin(async move {
                let channel = require_channel(&inner).await?;
                let results = channel
                    .call_wait(
                        "goto",
                        vec![
                            Value::from(url),
                            Value::Object(merged),
                            Value::from(inner.config.goto_timeout_ms),
                        ],
                    )
                    .await?;
                Ok(results.into_iter().next().unwrap_or(Value::Null))
            })
        })
    }

    pub fn back(&self) -> &Self {
        self.queue_eval("back", script::BACK_SRC, vec![])
    }

    pub fn forward(&self) -> &Self {
        self.queue_eval("forward", script::FORWARD_SRC, vec![])
    }

    pub fn refresh(&self) -> &Self {
        self.queue_eval("refresh", script::REFRESH_SRC, vec![])
    }

    /// The page's document title; becomes the run's value.
    pub fn title(&self) -> &Self {
        self.queue_eval("title", script::TITLE_SRC, vec![])
    }

    /// The page's current URL; becomes the run's value.
    pub fn url(&self) -> &Self {
        self.queue_eval("url", script::URL_SRC, vec![])
    }

    /// The page's current path; becomes the run's value.
    pub fn path(&self) -> &Self {
        self.queue_eval("path", script::PATH_SRC, vec![])
    }

    /// Whether `selector` matches anything; becomes the run's value.
    pub fn exists(&self, selector: impl Into<String>) -> &Self {
        self.queue_eval(
            "exists",
            script::EXISTS_SRC,
            vec![Value::from(selector.into())],
        )
    }

    /// Whether `selector` matches something visible.
    pub fn visible(&self, selector: impl Into<String>) -> &Self {
        self.queue_eval(
            "visible",
            script::VISIBLE_SRC,
            vec![Value::from(selector.into())],
        )
    }

    pub fn click(&self, selector: impl Into<String>) -> &Self {
        self.queue_eval(
            "click",
            script::CLICK_SRC,
            vec![Value::from(selector.into())],
        )
    }

    pub fn mousedown(&self, selector: impl Into<String>) -> &Self {
        self.queue_mouse("mousedown", selector.into())
    }

    pub fn mouseup(&self, selector: impl Into<String>) -> &Self {
        self.queue_mouse("mouseup", selector.into())
    }

    pub fn mouseover(&self, selector: impl Into<String>) -> &Self {
        self.queue_mouse("mouseover", selector.into())
    }

    pub fn mouseout(&self, selector: impl Into<String>) -> &Self {
        self.queue_mouse("mouseout", selector.into())
    }

    pub fn check(&self, selector: impl Into<String>) -> &Self {
        self.queue_eval(
            "check",
            script::SET_CHECKED_SRC,
            vec![Value::from(selector.into()), Value::from(true)],
        )
    }

    pub fn uncheck(&self, selector: impl Into<String>) -> &Self {
        self.queue_eval(
            "uncheck",
            script::SET_CHECKED_SRC,
            vec![Value::from(selector.into()), Value::from(false)],
        )
    }

    /// Set a `<select>`'s value and fire its change event.
    pub fn select_value(&self, selector: impl Into<String>, value: impl Into<String>) -> &Self {
        self.queue_eval(
            "select",
            script::SELECT_SRC,
            vec![Value::from(selector.into()), Value::from(value.into())],
        )
    }

    pub fn scroll_to(&self, top: i64, left: i64) -> &Self {
        self.queue_eval(
            "scrollTo",
            script::SCROLL_SRC,
            vec![Value::from(top), Value::from(left)],
        )
    }

    /// Focus `selector` and type `text` keystroke by keystroke. Empty
    /// text clears the field instead.
    pub fn type_text(&self, selector: impl Into<String>, text: impl Into<String>) -> &Self {
        let selector = selector.into();
        let text = text.into();
        self.queue_action("type", move |inner| {
            Box::pin(async move {
                evaluate_now(&inner, script::FOCUS_SRC, vec![Value::from(selector.clone())])
                    .await?;
                if text.is_empty() {
                    evaluate_now(
                        &inner,
                        script::CLEAR_VALUE_SRC,
                        vec![Value::from(selector.clone())],
                    )
                    .await?;
                } else {
                    let channel = require_channel(&inner).await?;
                    channel
                        .call_wait(
                            "type",
                            vec![
                                Value::from(text),
                                Value::from(inner.config.type_interval_ms),
                            ],
                        )
                        .await?;
                }
                evaluate_now(&inner, script::BLUR_SRC, vec![Value::from(selector)]).await?;
                Ok(Value::Null)
            })
        })
    }

    /// Focus `selector` and insert `text` in one shot, no key events.
    pub fn insert_text(&self, selector: impl Into<String>, text: impl Into<String>) -> &Self {
        let selector = selector.into();
        let text = text.into();
        self.queue_action("insert", move |inner| {
            Box::pin(async move {
                evaluate_now(&inner, script::FOCUS_SRC, vec![Value::from(selector.clone())])
                    .await?;
                let channel = require_channel(&inner).await?;
                channel.call_wait("insert", vec![Value::from(text)]).await?;
                evaluate_now(&inner, script::BLUR_SRC, vec![Value::from(selector)]).await?;
                Ok(Value::Null)
            })
        })
    }

    /// Pause for `duration`, clamped to the configured wait ceiling.
    pub fn wait(&self, duration: Duration) -> &Self {
        self.queue_action("wait", move |inner| {
            Box::pin(async move {
                wait::sleep_for(duration, inner.config.wait_timeout()).await?;
                Ok(Value::Null)
            })
        })
    }

    /// Wait until `selector` matches an element.
    pub fn wait_for_selector(&self, selector: impl Into<String>) -> &Self {
        self.queue_wait_selector(selector.into(), None)
    }

    /// Wait until `selector` matches, but give up successfully after
    /// `soft`: "give the page this long, then move on either way".
    pub fn wait_for_selector_soft(&self, selector: impl Into<String>, soft: Duration) -> &Self {
        self.queue_wait_selector(selector.into(), Some(soft))
    }

    /// Wait until a page-side predicate yields a truthy value.
    pub fn wait_for_fn(&self, src: impl Into<String>, args: Vec<Value>) -> &Self {
        self.queue_wait_fn(src.into(), args, None)
    }

    /// Predicate wait with an early-success bound.
    pub fn wait_for_fn_soft(
        &self,
        src: impl Into<String>,
        args: Vec<Value>,
        soft: Duration,
    ) -> &Self {
        self.queue_wait_fn(src.into(), args, Some(soft))
    }

    /// Evaluate `src` against the page; its value becomes the run's
    /// value. Bounded by the execution timeout.
    pub fn evaluate(&self, src: impl Into<String>, args: Vec<Value>) -> &Self {
        let src = src.into();
        self.queue_action("evaluate", move |inner| {
            Box::pin(async move {
                let limit = inner.config.execution_timeout();
                match tokio::time::timeout(limit, evaluate_now(&inner, &src, args)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(ControlError::EvaluationTimeout {
                        elapsed_ms: limit.as_millis() as u64,
                    }),
                }
            })
        })
    }

    /// Inject a script or stylesheet file into the page.
    pub fn inject(&self, kind: InjectKind, file: impl Into<PathBuf>) -> &Self {
        let file = file.into();
        self.queue_action("inject", move |inner| {
            Box::pin(async move {
                let source = tokio::fs::read_to_string(&file).await?;
                let channel = require_channel(&inner).await?;
                match kind {
                    InjectKind::Js => {
                        let wrapped = script::inject(&inner.identifier, &source);
                        channel
                            .call_wait("javascript", vec![Value::from(wrapped)])
                            .await?;
                    }
                    InjectKind::Css => {
                        channel.call_wait("css", vec![Value::from(source)]).await?;
                    }
                }
                Ok(Value::Null)
            })
        })
    }

    /// Resize the rendering viewport.
    pub fn viewport(&self, width: u32, height: u32) -> &Self {
        self.queue_call("size", vec![Value::from(width), Value::from(height)])
    }

    pub fn useragent(&self, agent: impl Into<String>) -> &Self {
        self.queue_call("useragent", vec![Value::from(agent.into())])
    }

    /// Credentials for HTTP authentication challenges.
    pub fn authentication(
        &self,
        login: impl Into<String>,
        password: impl Into<String>,
    ) -> &Self {
        self.queue_call(
            "authentication",
            vec![Value::from(login.into()), Value::from(password.into())],
        )
    }

    /// Capture the page; the raw image payload becomes the run's value.
    pub fn screenshot(&self) -> &Self {
        self.queue_call("screenshot", vec![Value::Null])
    }

    /// Capture the page and write it to `path`.
    pub fn screenshot_to(&self, path: impl Into<PathBuf>) -> &Self {
        let path = path.into();
        self.queue_action("screenshot", move |inner| {
            Box::pin(async move {
                let channel = require_channel(&inner).await?;
                let result = channel
                    .call_wait("screenshot", vec![Value::Null])
                    .await?
                    .into_iter()
                    .next()
                    .unwrap_or(Value::Null);
                let bytes = image_bytes(&result).ok_or(ControlError::RemoteValue {
                    value: result.clone(),
                })?;
                tokio::fs::write(&path, bytes).await?;
                Ok(Value::Null)
            })
        })
    }

    /// Save the page's HTML to `path`. `save_type` is the worker's
    /// serialization mode (complete page, HTML only, MHTML).
    pub fn html_to(&self, path: impl Into<PathBuf>, save_type: Option<&str>) -> &Self {
        let path = path.into().to_string_lossy().into_owned();
        let save_type = save_type.map(Value::from).unwrap_or(Value::Null);
        self.queue_call("html", vec![Value::from(path), save_type])
    }

    /// Print the page to PDF at `path` with worker-defined options.
    pub fn pdf_to(&self, path: impl Into<PathBuf>, options: Value) -> &Self {
        let path = path.into().to_string_lossy().into_owned();
        self.queue_call("pdf", vec![Value::from(path), options])
    }

    /// Fetch cookies matching `query`; they become the run's value.
    pub fn cookies_get(&self, query: Value) -> &Self {
        self.queue_call("cookie.get", vec![query])
    }

    pub fn cookies_set(&self, cookies: Value) -> &Self {
        self.queue_call("cookie.set", vec![cookies])
    }

    /// Clear one named cookie, or every cookie for the current page
    /// when `name` is `None`.
    pub fn cookies_clear(&self, name: Option<&str>) -> &Self {
        let args = name.map(|n| vec![Value::from(n)]).unwrap_or_default();
        self.queue_call("cookie.clear", args)
    }

    /// Clear all cookies in the session.
    pub fn cookies_clear_all(&self) -> &Self {
        self.queue_call("cookie.clearAll", vec![])
    }

    /// Teach the worker a custom named operation from source.
    pub fn register_action(&self, name: impl Into<String>, src: impl Into<String>) -> &Self {
        self.queue_call(
            "action",
            vec![Value::from(name.into()), Value::from(src.into())],
        )
    }

    /// Subscribe `handler` to a named worker event. The subscription is
    /// installed when this action runs and lives until the worker ends.
    pub fn on_event<F>(&self, name: impl Into<String>, handler: F) -> &Self
    where
        F: Fn(Vec<Value>) + Send + Sync + 'static,
    {
        let name = name.into();
        self.queue_action("on", move |inner| {
            Box::pin(async move {
                let channel = require_channel(&inner).await?;
                let mut rx = channel.subscribe();
                let closed = channel.closed_token();
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = closed.cancelled() => break,
                            event = rx.recv() => match event {
                                Ok(event) if event.name == name => handler(event.payload),
                                Ok(_) => {}
                                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                                Err(broadcast::error::RecvError::Closed) => break,
                            },
                        }
                    }
                });
                Ok(Value::Null)
            })
        })
    }

    /// Engine/runtime version metadata from the ready announcement.
    pub fn engine_versions(&self) -> &Self {
        self.queue_action("engineVersions", |inner| {
            Box::pin(async move {
                let worker = inner.worker.lock().await;
                Ok(worker
                    .as_ref()
                    .map(|w| w.versions.clone())
                    .unwrap_or(Value::Null))
            })
        })
    }

    fn queue_eval(&self, name: &'static str, src: &'static str, args: Vec<Value>) -> &Self {
        self.queue_action(name, move |inner| {
            Box::pin(async move { evaluate_now(&inner, src, args).await })
        })
    }

    fn queue_mouse(&self, event_type: &'static str, selector: String) -> &Self {
        self.queue_eval(
            event_type,
            script::MOUSE_EVENT_SRC,
            vec![Value::from(selector), Value::from(event_type)],
        )
    }

    fn queue_wait_selector(&self, selector: String, soft: Option<Duration>) -> &Self {
        self.queue_action("wait", move |inner| {
            Box::pin(async move {
                let settings = WaitSettings {
                    hard_timeout: inner.config.wait_timeout(),
                    soft_timeout: soft,
                    poll_interval: inner.config.poll_interval(),
                    selector: Some(selector.clone()),
                };
                let eval_inner = Arc::clone(&inner);
                wait::wait_predicate(&settings, move || {
                    let inner = Arc::clone(&eval_inner);
                    let selector = selector.clone();
                    async move {
                        evaluate_now(&inner, script::EXISTS_SRC, vec![Value::from(selector)]).await
                    }
                })
                .await?;
                Ok(Value::Null)
            })
        })
    }

    fn queue_wait_fn(&self, src: String, args: Vec<Value>, soft: Option<Duration>) -> &Self {
        self.queue_action("wait", move |inner| {
            Box::pin(async move {
                let settings = WaitSettings {
                    hard_timeout: inner.config.wait_timeout(),
                    soft_timeout: soft,
                    poll_interval: inner.config.poll_interval(),
                    selector: None,
                };
                let eval_inner = Arc::clone(&inner);
                let src = Arc::new(src);
                let args = Arc::new(args);
                wait::wait_predicate(&settings, move || {
                    let inner = Arc::clone(&eval_inner);
                    let src = Arc::clone(&src);
                    let args = Arc::clone(&args);
                    async move { evaluate_now(&inner, &src, args.as_ref().clone()).await }
                })
                .await?;
                Ok(Value::Null)
            })
        })
    }
}

fn image_bytes(value: &Value) -> Option<Vec<u8>> {
    value
        .get("data")?
        .as_array()?
        .iter()
        .map(|v| v.as_u64().and_then(|n| u8::try_from(n).ok()))
        .collect()
}
