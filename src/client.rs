//! Cliente con límite de tasa: el único punto por el que sale cualquier
//! llamada a un servicio externo (generación, búsqueda o diagramas).

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use reqwest::header::RETRY_AFTER;
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::ServiceLimits;
use crate::error::ServiceError;

/// Contador de peticiones restantes, compartido por todos los clones del cliente.
#[derive(Debug)]
pub struct RequestBudget {
    remaining: AtomicU64,
}

impl RequestBudget {
    pub fn new(limit: u64) -> Self {
        Self {
            remaining: AtomicU64::new(limit),
        }
    }

    /// Consume una unidad; `false` si ya no queda ninguna.
    pub fn try_take(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    pub fn remaining(&self) -> u64 {
        self.remaining.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug)]
pub struct ApiClient {
    service: Arc<str>,
    http: reqwest::Client,
    limits: ServiceLimits,
    permits: Arc<Semaphore>,
    budget: Arc<RequestBudget>,
}

impl ApiClient {
    pub fn new(service: &str, limits: ServiceLimits) -> Self {
        Self::with_http(service, limits, reqwest::Client::new())
    }

    pub fn with_http(service: &str, limits: ServiceLimits, http: reqwest::Client) -> Self {
        Self {
            service: Arc::from(service),
            http,
            permits: Arc::new(Semaphore::new(limits.max_in_flight.max(1))),
            budget: Arc::new(RequestBudget::new(limits.request_budget)),
            limits,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn limits(&self) -> &ServiceLimits {
        &self.limits
    }

    pub fn remaining_budget(&self) -> u64 {
        self.budget.remaining()
    }

    /// Ejecuta `call` bajo el semáforo del servicio, con timeout, presupuesto
    /// y reintentos con backoff exponencial para los errores transitorios.
    /// Cada intento consume una unidad del presupuesto.
    pub async fn execute<T, F, Fut>(&self, label: &str, mut call: F) -> Result<T, ServiceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            if !self.budget.try_take() {
                warn!(service = %self.service, label, "Presupuesto de peticiones agotado");
                return Err(ServiceError::BudgetExhausted {
                    service: self.service.to_string(),
                });
            }

            let started = Instant::now();
            let result = {
                // El permiso se libera antes de dormir el backoff.
                let _permit = self.permits.acquire().await.map_err(|_| {
                    ServiceError::NetworkError {
                        service: self.service.to_string(),
                        message: "semáforo cerrado".to_string(),
                    }
                })?;
                match tokio::time::timeout(self.limits.timeout, call()).await {
                    Ok(result) => result,
                    Err(_) => Err(ServiceError::Timeout {
                        service: self.service.to_string(),
                        after: self.limits.timeout,
                    }),
                }
            };
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(value) => {
                    info!(
                        service = %self.service,
                        label,
                        attempt,
                        elapsed_ms,
                        outcome = "ok",
                        "Llamada completada"
                    );
                    return Ok(value);
                }
                Err(err) => {
                    warn!(
                        service = %self.service,
                        label,
                        attempt,
                        elapsed_ms,
                        outcome = err.outcome(),
                        error = %err,
                        "Llamada fallida"
                    );
                    if !err.is_transient() || attempt >= self.limits.max_retries {
                        return Err(err);
                    }
                    let delay = self.backoff(attempt, &err);
                    debug!(service = %self.service, label, ?delay, "Reintentando");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// `base * 2^intento` con tope y jitter; un `Retry-After` explícito manda.
    fn backoff(&self, attempt: u32, err: &ServiceError) -> Duration {
        if let ServiceError::RateLimited {
            retry_after: Some(wait),
            ..
        } = err
        {
            return (*wait).min(self.limits.backoff_max);
        }
        let exp = self
            .limits
            .backoff_base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.limits.backoff_max);
        let jitter: f64 = rand::thread_rng().gen_range(0.8..1.2);
        exp.mul_f64(jitter)
    }

    /// Petición HTTP con respuesta JSON. `build` se invoca en cada intento.
    pub async fn call_json<T, B>(&self, label: &str, build: B) -> Result<T, ServiceError>
    where
        T: DeserializeOwned,
        B: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        self.execute(label, || {
            let request = build(&self.http);
            async move {
                let response = self.send(request).await?;
                response
                    .json::<T>()
                    .await
                    .map_err(|e| ServiceError::from_reqwest(&self.service, &e))
            }
        })
        .await
    }

    /// Igual que `call_json` pero devuelve el cuerpo en bruto.
    pub async fn call_bytes<B>(&self, label: &str, build: B) -> Result<Vec<u8>, ServiceError>
    where
        B: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        self.execute(label, || {
            let request = build(&self.http);
            async move {
                let response = self.send(request).await?;
                response
                    .bytes()
                    .await
                    .map(|b| b.to_vec())
                    .map_err(|e| ServiceError::from_reqwest(&self.service, &e))
            }
        })
        .await
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ServiceError> {
        let response = request
            .send()
            .await
            .map_err(|e| ServiceError::from_reqwest(&self.service, &e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await.unwrap_or_default();
        Err(ServiceError::from_status(
            &self.service,
            status.as_u16(),
            truncate(&body, 300),
            retry_after,
        ))
    }
}

fn truncate(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}
