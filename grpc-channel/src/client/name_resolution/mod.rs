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

//! Name Resolution for gRPC.
//!
//! Name Resolution is the process by which a channel's target is converted into
//! network addresses (typically IP addresses) used by the channel to connect to
//! a service.  A [`ResolverBuilder`] is registered per URI scheme; the channel
//! builds one [`Resolver`] for its target and restarts it each time the
//! channel leaves idle mode.

use std::fmt::{self, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use tonic::Status;
use url::Url;

use crate::attributes::Attributes;
use crate::rt::GrpcRuntime;

mod passthrough;
mod registry;

pub use passthrough::PassthroughResolverBuilder;
pub use registry::{GLOBAL_RESOLVER_REGISTRY, ResolverRegistry};

/// Target represents a target for gRPC, as specified in:
/// https://github.com/grpc/grpc/blob/master/doc/naming.md.
/// It is parsed from the target string that gets passed during channel creation
/// by the user. gRPC passes it to the resolver and the balancer.
///
/// If the target follows the gRPC naming conventions, and the parsed scheme is registered
/// with gRPC, we will parse the target string according to them. If the
/// target does not contain a scheme or if the parsed scheme is not registered
/// (i.e. no corresponding resolver available to resolve the endpoint), we will
/// apply the default scheme, and will attempt to reparse it.
#[derive(Debug, Clone)]
pub struct Target {
    url: Url,
}

impl FromStr for Target {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.parse::<Url>() {
            Ok(url) => Ok(Target { url }),
            Err(err) => Err(err.to_string()),
        }
    }
}

impl From<url::Url> for Target {
    fn from(url: url::Url) -> Self {
        Target { url }
    }
}

impl Target {
    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    /// The host part of the authority.
    pub fn authority_host(&self) -> &str {
        self.url.host_str().unwrap_or("")
    }

    /// The port part of the authority.
    pub fn authority_port(&self) -> Option<u16> {
        self.url.port()
    }

    /// Returns either host:port or host depending on the existence of the port
    /// in the authority.
    pub fn authority_host_port(&self) -> String {
        let host = self.authority_host();
        let port = self.authority_port();
        if let Some(port) = port {
            format!("{host}:{port}")
        } else {
            host.to_owned()
        }
    }

    /// Retrieves endpoint from `Url.path()`.
    pub fn path(&self) -> &str {
        self.url.path()
    }
}

impl Display for Target {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}://{}{}",
            self.scheme(),
            self.authority_host_port(),
            self.path()
        )
    }
}

/// A name resolver factory that produces Resolver instances used by the channel
/// to resolve network addresses for the target URI.
pub trait ResolverBuilder: Send + Sync {
    /// Builds a name resolver for `target`, or returns None if this builder
    /// cannot resolve it.  The returned resolver must not do any work until it
    /// is started.
    fn build(&self, target: &Target, options: &ResolverOptions) -> Option<Box<dyn Resolver>>;

    /// Reports the URI scheme handled by this name resolver.
    fn scheme(&self) -> &str;
}

/// A collection of data configured on the channel that is constructing this
/// name resolver.
#[derive(Clone)]
#[non_exhaustive]
pub struct ResolverOptions {
    /// The runtime which provides utilities to do async work.
    pub runtime: GrpcRuntime,

    /// Arbitrary parameters for the resolver, set by the channel's creator.
    pub attributes: Attributes,
}

/// Resolver watches for the updates on the specified target.
///
/// All methods are called from the channel's work serializer, never
/// concurrently.
pub trait Resolver: Send {
    /// Starts resolution.  Results and errors are delivered to `listener`,
    /// possibly from within this call.  An error returned here is delivered to
    /// the load balancer as a resolution error.
    fn start(&mut self, listener: Box<dyn ResolverListener>) -> Result<(), Status>;

    /// Asks the resolver to resolve again.  Called when connections fail,
    /// which may indicate that the resolved addresses are stale.  The resolver
    /// may rate limit or ignore this.
    fn refresh(&mut self);

    /// Stops resolution.  No further results are delivered after this
    /// returns.
    fn shutdown(&mut self);

    /// The authority to use for calls on the channel, usually derived from
    /// the target.
    fn service_authority(&self) -> String;
}

/// Receives results from a started [`Resolver`].  May be called from any
/// thread.
pub trait ResolverListener: Send + Sync {
    /// Delivers the latest set of address groups.  An empty list is treated
    /// as an error.
    fn on_addresses(&self, groups: Vec<AddressGroup>, attributes: Attributes);

    /// Reports a resolution failure.  `status` must not be OK.
    fn on_error(&self, status: Status);
}

/// A group of addresses which reference one logical server.  Multiple
/// addresses may be used if there are multiple ways which the server can be
/// reached, e.g. via IPv4 and IPv6 addresses.  A subchannel connects to one
/// group, trying its addresses in order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct AddressGroup {
    pub addresses: Vec<Address>,

    /// Attributes contains arbitrary data about this group intended for
    /// consumption by the load balancer.
    pub attributes: Attributes,
}

impl AddressGroup {
    pub fn new(addresses: Vec<Address>) -> Self {
        Self {
            addresses,
            attributes: Attributes::new(),
        }
    }

    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }
}

impl Hash for AddressGroup {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addresses.hash(state);
    }
}

impl Display for AddressGroup {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, address) in self.addresses.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{address}")?;
        }
        write!(f, "]")
    }
}

/// An Address is an identifier that indicates how to connect to a server.
#[non_exhaustive]
#[derive(Debug, Clone, Default)]
pub struct Address {
    /// The network type is used to identify what kind of transport to create
    /// when connecting to this address.  Typically TCP_IP_NETWORK_TYPE.
    pub network_type: &'static str,

    /// The address itself is passed to the transport in order to create a
    /// connection to it.
    pub address: String,

    /// Attributes contains arbitrary data about this address intended for
    /// consumption by the subchannel.
    pub attributes: Attributes,
}

impl Address {
    /// Creates a TCP/IP address.
    pub fn tcp(address: impl Into<String>) -> Self {
        Self {
            network_type: TCP_IP_NETWORK_TYPE,
            address: address.into(),
            attributes: Attributes::new(),
        }
    }
}

impl Eq for Address {}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.network_type == other.network_type && self.address == other.address
    }
}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.network_type.hash(state);
        self.address.hash(state);
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.network_type, self.address)
    }
}

/// Indicates the address is an IPv4 or IPv6 address that should be connected to
/// via TCP/IP.
pub static TCP_IP_NETWORK_TYPE: &str = "tcp";

/// Reports whether `target` is written as an absolute hierarchical URI, i.e.
/// matches `[a-zA-Z][a-zA-Z0-9+.-]*:/.*`.  Targets that do not are retried
/// with the default scheme when no resolver claims them.
pub(crate) fn looks_like_uri(target: &str) -> bool {
    let mut chars = target.chars();
    if !chars.next().is_some_and(|c| c.is_ascii_alphabetic()) {
        return false;
    }
    for c in chars.by_ref() {
        match c {
            ':' => return chars.next() == Some('/'),
            c if c.is_ascii_alphanumeric() || matches!(c, '+' | '.' | '-') => {}
            _ => return false,
        }
    }
    false
}
