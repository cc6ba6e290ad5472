/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

//! The request and response types exchanged between the channel and its
//! transports.  Messages are opaque, already-serialized bytes.

use std::pin::Pin;

use bytes::Bytes;
use tokio_stream::Stream;
use tonic::{Request as TonicRequest, Response as TonicResponse, Status, async_trait};

pub type RequestStream = Pin<Box<dyn Stream<Item = Bytes> + Send>>;
pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<Bytes, Status>> + Send>>;

pub type Request = TonicRequest<RequestStream>;
pub type Response = TonicResponse<ResponseStream>;

#[async_trait]
pub trait Service: Send + Sync {
    async fn call(&self, method: String, request: Request) -> Response;
}

/// Builds a request from a list of messages.
pub fn request_from_messages(messages: Vec<Bytes>) -> Request {
    Request::new(Box::pin(tokio_stream::iter(messages)))
}

/// Builds a response whose stream yields only `status`.  This is how calls
/// that fail before reaching a transport are reported.
pub fn error_response(status: Status) -> Response {
    Response::new(Box::pin(tokio_stream::once(Err(status))))
}
