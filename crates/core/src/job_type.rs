//! Job types and handler descriptors.

use std::fmt;
use std::sync::Arc;

use anyhow::Context;

use crate::error::JobError;
use crate::payload::{JobPayload, Payload, PayloadKind};

/// What a handler returns. Errors are recorded on the job and drive retries.
pub type HandlerResult = anyhow::Result<()>;

type HandlerBody = Arc<dyn Fn(Vec<Payload>) -> HandlerResult + Send + Sync>;

/// A handler together with its declared signature.
///
/// The signature is explicit: `params` lists the payload kind of each
/// declared parameter. Only arity 0 and 1 are accepted at registration.
/// The typed constructors derive the signature from the closure type;
/// [`Handler::from_parts`] and [`Handler::declared`] build descriptors from
/// runtime information (e.g. a scripting bridge), which is where an invalid
/// arity or a missing body can come from.
#[derive(Clone)]
pub struct Handler {
    params: Vec<PayloadKind>,
    body: Option<HandlerBody>,
}

impl Handler {
    /// Handler with no parameter; job data is ignored.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn() -> HandlerResult + Send + Sync + 'static,
    {
        Self {
            params: Vec::new(),
            body: Some(Arc::new(move |_| f())),
        }
    }

    /// Handler taking the raw payload, declared with the given shape.
    pub fn with_payload<F>(kind: PayloadKind, f: F) -> Self
    where
        F: Fn(Payload) -> HandlerResult + Send + Sync + 'static,
    {
        Self {
            params: vec![kind],
            body: Some(Arc::new(move |mut args| f(args.pop().unwrap_or(Payload::Null)))),
        }
    }

    /// Handler taking a deserialized `T`; the declared shape is `T::KIND`.
    pub fn typed<T, F>(f: F) -> Self
    where
        T: JobPayload,
        F: Fn(T) -> HandlerResult + Send + Sync + 'static,
    {
        Self {
            params: vec![T::KIND],
            body: Some(Arc::new(move |mut args| {
                let raw = args.pop().unwrap_or(Payload::Null);
                let value: T = serde_json::from_value(raw).with_context(|| {
                    format!(
                        "payload does not deserialize into {}",
                        std::any::type_name::<T>()
                    )
                })?;
                f(value)
            })),
        }
    }

    /// Descriptor assembled from a runtime signature and body.
    pub fn from_parts<F>(params: Vec<PayloadKind>, body: F) -> Self
    where
        F: Fn(Vec<Payload>) -> HandlerResult + Send + Sync + 'static,
    {
        Self {
            params,
            body: Some(Arc::new(body)),
        }
    }

    /// Descriptor with a signature but nothing to invoke.
    pub fn declared(params: Vec<PayloadKind>) -> Self {
        Self { params, body: None }
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }

    pub fn params(&self) -> &[PayloadKind] {
        &self.params
    }

    pub fn is_invocable(&self) -> bool {
        self.body.is_some()
    }

    fn validate(&self) -> Result<(), JobError> {
        if self.body.is_none() {
            return Err(JobError::invalid_handler("handler is not invocable"));
        }
        if self.params.len() > 1 {
            return Err(JobError::invalid_handler(format!(
                "handler must take zero or one parameter, declared {}",
                self.params.len()
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("params", &self.params)
            .field("invocable", &self.body.is_some())
            .finish()
    }
}

/// A registered unit-of-work definition. Immutable once built.
#[derive(Debug)]
pub struct JobType {
    name: String,
    retries: u32,
    handler: Handler,
}

impl JobType {
    /// Validate the handler and build the type. Registration goes through
    /// [`crate::registry::JobTypeRegistry::register`].
    pub(crate) fn new(name: String, retries: u32, handler: Handler) -> Result<Self, JobError> {
        handler.validate()?;
        Ok(Self {
            name,
            retries,
            handler,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Re-executions permitted after the first failure.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn handler_arity(&self) -> usize {
        self.handler.arity()
    }

    /// Expected payload shape when the handler takes a parameter.
    pub fn handler_payload_kind(&self) -> Option<PayloadKind> {
        self.handler.params().first().copied()
    }

    /// Schedule-time shape check. Arity-0 types accept any data.
    pub fn validate_payload(&self, data: &Payload) -> Result<(), JobError> {
        match self.handler_payload_kind() {
            Some(expected) if !expected.accepts(data) => Err(JobError::InvalidJobData {
                job_type: self.name.clone(),
                expected,
                found: PayloadKind::of(data),
            }),
            _ => Ok(()),
        }
    }

    /// Run the handler on the calling thread.
    ///
    /// Handler errors are returned as-is; panics are not caught here.
    pub fn invoke(&self, payload: Payload) -> HandlerResult {
        let args = if self.handler_arity() == 1 {
            vec![payload]
        } else {
            Vec::new()
        };
        match &self.handler.body {
            Some(body) => body(args),
            None => Err(anyhow::anyhow!("handler is not invocable")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[test]
    fn zero_arity_handler_ignores_data() {
        let jt = JobType::new("noop".into(), 0, Handler::new(|| Ok(()))).unwrap();
        assert_eq!(jt.handler_arity(), 0);
        assert_eq!(jt.handler_payload_kind(), None);
        assert!(jt.validate_payload(&json!(42)).is_ok());
        assert!(jt.invoke(json!(42)).is_ok());
    }

    #[test]
    fn typed_handler_declares_its_kind() {
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let jt = JobType::new(
            "greet".into(),
            1,
            Handler::typed(move |name: String| {
                *sink.lock().unwrap() = Some(name);
                Ok(())
            }),
        )
        .unwrap();

        assert_eq!(jt.handler_payload_kind(), Some(PayloadKind::String));
        assert!(jt.validate_payload(&json!("bob")).is_ok());
        assert_eq!(
            jt.validate_payload(&json!(0)),
            Err(JobError::InvalidJobData {
                job_type: "greet".into(),
                expected: PayloadKind::String,
                found: PayloadKind::Int,
            })
        );

        jt.invoke(json!("bob")).unwrap();
        assert_eq!(seen.lock().unwrap().as_deref(), Some("bob"));
    }

    #[test]
    fn typed_handler_reports_undecodable_payload() {
        let jt = JobType::new("count".into(), 0, Handler::typed(|_: u8| Ok(()))).unwrap();
        let err = jt.invoke(json!(1000)).unwrap_err();
        assert!(err.to_string().contains("payload does not deserialize"));
    }

    #[test]
    fn rejects_two_parameters() {
        let handler = Handler::from_parts(vec![PayloadKind::String, PayloadKind::String], |_| Ok(()));
        let err = JobType::new("pair".into(), 0, handler).unwrap_err();
        assert!(matches!(err, JobError::InvalidHandler(_)));
    }

    #[test]
    fn rejects_body_less_descriptor() {
        let err = JobType::new("ghost".into(), 0, Handler::declared(vec![])).unwrap_err();
        assert!(matches!(err, JobError::InvalidHandler(_)));
    }

    #[test]
    fn handler_errors_propagate() {
        let jt = JobType::new("boom".into(), 0, Handler::new(|| anyhow::bail!("smtp down"))).unwrap();
        assert_eq!(jt.invoke(Payload::Null).unwrap_err().to_string(), "smtp down");
    }
}
