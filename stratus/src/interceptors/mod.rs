//! Request and response interceptors.

mod chain;

pub use chain::{Interceptor, InterceptorChain};
