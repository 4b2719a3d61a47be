use std::sync::{Arc, Mutex};

use serde::Serialize;

/// Estado de progreso visible desde fuera de la ejecución.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct Status {
    pub is_busy: bool,
    pub message: String,
    pub progress: f32, // Valor entre 0.0 y 1.0
}

/// Manejador compartido del `Status`; clonarlo comparte el mismo estado.
///
/// Cada manejador escala su progreso a una ventana `[start, end]` del total,
/// de modo que una subtarea puede informar de 0.0 a 1.0 sin retroceder la
/// barra global.
#[derive(Debug, Clone)]
pub struct StatusHandle {
    inner: Arc<Mutex<Status>>,
    window: (f32, f32),
}

impl Default for StatusHandle {
    fn default() -> Self {
        Self::new(String::new())
    }
}

impl StatusHandle {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Status {
                is_busy: false,
                message: message.into(),
                progress: 0.0,
            })),
            window: (0.0, 1.0),
        }
    }

    /// Manejador sobre el mismo estado cuyo progreso ocupa `[start, end]`
    /// de la ventana actual.
    pub fn within(&self, start: f32, end: f32) -> Self {
        Self {
            inner: self.inner.clone(),
            window: (self.scale(start), self.scale(end)),
        }
    }

    pub fn snapshot(&self) -> Status {
        self.inner.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn begin(&self, message: impl Into<String>) {
        self.set(true, message.into(), 0.0);
    }

    pub fn progress(&self, message: impl Into<String>, progress: f32) {
        self.set(true, message.into(), self.scale(progress));
    }

    pub fn finish(&self, message: impl Into<String>) {
        self.set(false, message.into(), 1.0);
    }

    fn scale(&self, progress: f32) -> f32 {
        let (start, end) = self.window;
        start + (end - start) * progress.clamp(0.0, 1.0)
    }

    fn set(&self, is_busy: bool, message: String, progress: f32) {
        // Un mutex envenenado sólo pierde una actualización de progreso.
        if let Ok(mut status) = self.inner.lock() {
            status.is_busy = is_busy;
            status.message = message;
            status.progress = progress;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let status = StatusHandle::new("Listo.");
        let observer = status.clone();
        status.progress("Redactando", 1.7);
        assert_eq!(
            observer.snapshot(),
            Status {
                is_busy: true,
                message: "Redactando".into(),
                progress: 1.0
            }
        );
        status.finish("Hecho");
        assert!(!observer.snapshot().is_busy);
    }

    #[test]
    fn windowed_progress_stays_inside_its_range() {
        let status = StatusHandle::new("Listo.");
        let ingest = status.within(0.05, 0.15);
        ingest.progress("[1/2]", 0.0);
        assert!((status.snapshot().progress - 0.05).abs() < 1e-6);
        ingest.progress("[2/2]", 1.0);
        assert!((status.snapshot().progress - 0.15).abs() < 1e-6);

        let nested = ingest.within(0.5, 1.0);
        nested.progress("mitad", 0.0);
        assert!((status.snapshot().progress - 0.10).abs() < 1e-6);
    }
}
