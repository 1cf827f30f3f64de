//! Blocking worker pool for the SCP listener. `dicom-ul`'s server-association
//! API is synchronous (built on `std::net::TcpStream`), so associations are
//! dispatched to a fixed pool of OS threads rather than `tokio::spawn`ed —
//! verbatim in spirit from the teacher's `threads::ThreadPool`
//! (https://doc.rust-lang.org/book/ch20-02-multithreaded.html).

use std::sync::{mpsc, Arc, Mutex};
use std::thread;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct ThreadPool {
    workers: Vec<Worker>,
    sender: Option<mpsc::Sender<Job>>,
}

impl ThreadPool {
    pub fn new(size: usize) -> ThreadPool {
        assert!(size > 0, "thread pool cannot have 0 threads");
        let (sender, receiver) = mpsc::channel();
        let receiver = Arc::new(Mutex::new(receiver));
        let workers = (0..size).map(|id| Worker::new(id, Arc::clone(&receiver))).collect();
        ThreadPool { workers, sender: Some(sender) }
    }

    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let job = Box::new(f);
        self.sender
            .as_ref()
            .expect("thread pool has been shut down")
            .send(job)
            .expect("worker threads should still be receiving");
    }

    /// Close the pool, joining every worker. Unlike `Drop`, this is an
    /// explicit method so a CTRL-C handler can choose not to wait.
    pub fn shutdown(&mut self) {
        drop(self.sender.take());
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                thread.join().expect("worker thread panicked");
            }
        }
    }
}

struct Worker {
    thread: Option<thread::JoinHandle<()>>,
}

impl Worker {
    fn new(id: usize, receiver: Arc<Mutex<mpsc::Receiver<Job>>>) -> Worker {
        let thread = thread::spawn(move || loop {
            let message = receiver.lock().expect("worker pool mutex poisoned").recv();
            match message {
                Ok(job) => job(),
                Err(_) => {
                    tracing::debug!(worker_id = id, "scp worker shutting down");
                    break;
                }
            }
        });
        Worker { thread: Some(thread) }
    }
}
