//! HTTP message model shared by the transport, the interceptors and the client.

pub mod headers;
mod message;

pub use headers::{names, Headers};
pub use message::{
    BodyProvider, Endpoint, Method, OneShotBody, Request, RequestBody, RequestHead, Response,
    ResponseHead, Scheme,
};
