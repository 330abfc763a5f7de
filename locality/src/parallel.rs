//! Control over the number of threads used by the data-parallel phases of
//! neighbor searches.
//!
//! All parallel work in this crate runs through [`install`], which uses
//! rayon's global thread pool when the number of threads is set to 0 (the
//! default, meaning "all hardware threads"), and a dedicated thread pool
//! with the requested number of threads otherwise.
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use once_cell::sync::Lazy;

use crate::Error;

struct ThreadsSetting {
    requested: usize,
    pool: Option<Arc<rayon::ThreadPool>>,
}

static THREADS: Lazy<Mutex<ThreadsSetting>> = Lazy::new(|| Mutex::new(ThreadsSetting {
    requested: 0,
    pool: None,
}));

/// Set the number of threads used by parallel computations. `0` means using
/// all available hardware threads.
pub fn set_num_threads(n_threads: usize) -> Result<(), Error> {
    let pool = if n_threads == 0 {
        None
    } else {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(n_threads)
            .thread_name(|i| format!("locality-worker-{}", i))
            .build()
            .map_err(|e| Error::InvalidParameter(format!(
                "failed to create a thread pool with {} threads: {}", n_threads, e
            )))?;
        Some(Arc::new(pool))
    };

    debug!("using {} threads for parallel computations", n_threads);

    let mut setting = THREADS.lock().expect("mutex was poisoned");
    setting.requested = n_threads;
    setting.pool = pool;
    Ok(())
}

/// Get the number of threads requested with [`set_num_threads`], `0`
/// meaning all hardware threads.
pub fn num_threads() -> usize {
    THREADS.lock().expect("mutex was poisoned").requested
}

/// Get the number of threads that will actually be used by the next call to
/// [`install`].
pub fn current_num_threads() -> usize {
    install(rayon::current_num_threads)
}

/// Run `function` with the currently configured number of threads. Rayon
/// parallel iterators used inside `function` will run on these threads.
pub fn install<R, F>(function: F) -> R where F: FnOnce() -> R + Send, R: Send {
    // clone the pool and release the lock before running the function, to
    // allow nested calls and concurrent changes of the setting
    let pool = THREADS.lock().expect("mutex was poisoned").pool.clone();
    match pool {
        Some(pool) => pool.install(function),
        None => function(),
    }
}

/// Scoped override of the number of threads. The previous setting is
/// restored when this guard is dropped.
///
/// ```
/// # use locality::parallel::{NumThreads, num_threads};
/// let before = num_threads();
/// {
///     let _guard = NumThreads::new(2).unwrap();
///     assert_eq!(num_threads(), 2);
/// }
/// assert_eq!(num_threads(), before);
/// ```
#[must_use = "the previous number of threads is restored when the guard is dropped"]
pub struct NumThreads {
    previous: usize,
}

impl NumThreads {
    /// Use `n_threads` threads until the returned guard is dropped
    pub fn new(n_threads: usize) -> Result<NumThreads, Error> {
        let previous = num_threads();
        set_num_threads(n_threads)?;
        Ok(NumThreads { previous })
    }
}

impl Drop for NumThreads {
    fn drop(&mut self) {
        if let Err(e) = set_num_threads(self.previous) {
            warn!("failed to restore the number of threads: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_restore() {
        set_num_threads(0).unwrap();
        assert_eq!(num_threads(), 0);
        assert_eq!(current_num_threads(), rayon::current_num_threads());

        set_num_threads(3).unwrap();
        assert_eq!(num_threads(), 3);
        assert_eq!(current_num_threads(), 3);

        set_num_threads(1).unwrap();
        {
            let _guard = NumThreads::new(2).unwrap();
            assert_eq!(num_threads(), 2);
            assert_eq!(install(rayon::current_num_threads), 2);
        }
        // the previous value is restored after the guard
        assert_eq!(num_threads(), 1);

        set_num_threads(0).unwrap();
    }
}
