//! Shared fixtures for unit and integration tests

use crate::scheduler::{AsyncMethod, MethodQueue};
use crate::target::Programmable;
use std::any::Any;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// A target that queues methods on its own [`MethodQueue`]
pub struct TestTarget {
    guid: String,
    name: String,
    pub queue: Mutex<MethodQueue>,
    pub tests_run: AtomicUsize,
}

impl TestTarget {
    pub fn new(guid: &str, name: &str) -> Self {
        Self {
            guid: guid.to_string(),
            name: name.to_string(),
            queue: Mutex::new(MethodQueue::new()),
            tests_run: AtomicUsize::new(0),
        }
    }

    pub fn tick(&self) {
        self.queue.lock().unwrap().tick();
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

impl Programmable for TestTarget {
    fn guid(&self) -> &str {
        &self.guid
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn enqueue_method(&self, method: AsyncMethod) {
        self.queue.lock().unwrap().enqueue(method);
    }

    fn run_test(&self) {
        self.tests_run.fetch_add(1, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Run `f` with a thread-local subscriber and return its result plus the formatted log output
pub fn capture_logs<T>(f: impl FnOnce() -> T) -> (T, String) {
    let buffer = LogBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::TRACE)
        .finish();
    let result = tracing::subscriber::with_default(subscriber, f);
    let logs = String::from_utf8_lossy(&buffer.0.lock().unwrap()).into_owned();
    (result, logs)
}
