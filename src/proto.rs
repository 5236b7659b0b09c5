//! Wire messages exchanged between peers.
//!
//! Messages are declared with `prost` derives directly so the crate builds
//! without a protobuf compiler. Field tags are part of the wire contract and
//! must not be renumbered.

/// One length-prefixed unit on a connection.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Frame {
    #[prost(oneof = "frame::Kind", tags = "1, 2, 3, 4, 5, 6")]
    pub kind: ::core::option::Option<frame::Kind>,
}

pub mod frame {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        Hello(super::Hello),
        #[prost(message, tag = "2")]
        Welcome(super::Welcome),
        #[prost(message, tag = "3")]
        Refused(super::Refused),
        #[prost(message, tag = "4")]
        Call(super::Call),
        #[prost(message, tag = "5")]
        Reply(super::Reply),
        #[prost(message, tag = "6")]
        Event(super::Event),
    }
}

/// First frame sent by the dialing side.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Hello {
    /// Server id of the caller, so the listener can identify it.
    #[prost(string, tag = "1")]
    pub self_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub secret: ::prost::alloc::string::String,
}

/// Handshake acceptance sent by the listening side.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Welcome {
    #[prost(string, tag = "1")]
    pub server_id: ::prost::alloc::string::String,
    /// Modules the listener serves for remote invocation.
    #[prost(string, repeated, tag = "2")]
    pub modules: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

/// Handshake rejection sent by the listening side.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Refused {
    #[prost(string, tag = "1")]
    pub reason: ::prost::alloc::string::String,
}

/// Remote module invocation.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Call {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(string, tag = "2")]
    pub module: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub method: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "4")]
    pub payload: ::prost::alloc::vec::Vec<u8>,
}

/// Result of a `Call`, correlated by id.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Reply {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(oneof = "reply::Outcome", tags = "2, 3")]
    pub outcome: ::core::option::Option<reply::Outcome>,
}

pub mod reply {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Outcome {
        #[prost(bytes, tag = "2")]
        Ok(::prost::alloc::vec::Vec<u8>),
        #[prost(string, tag = "3")]
        Error(::prost::alloc::string::String),
    }
}

/// Published event relayed between processes.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Event {
    #[prost(string, tag = "1")]
    pub topic: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: ::prost::alloc::vec::Vec<u8>,
    /// Server id of the publishing process.
    #[prost(string, tag = "3")]
    pub origin: ::prost::alloc::string::String,
}

impl Frame {
    pub fn hello(self_id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            kind: Some(frame::Kind::Hello(Hello {
                self_id: self_id.into(),
                secret: secret.into(),
            })),
        }
    }

    pub fn welcome(server_id: impl Into<String>, modules: Vec<String>) -> Self {
        Self {
            kind: Some(frame::Kind::Welcome(Welcome {
                server_id: server_id.into(),
                modules,
            })),
        }
    }

    pub fn refused(reason: impl Into<String>) -> Self {
        Self {
            kind: Some(frame::Kind::Refused(Refused {
                reason: reason.into(),
            })),
        }
    }

    pub fn call(id: u64, module: &str, method: &str, payload: Vec<u8>) -> Self {
        Self {
            kind: Some(frame::Kind::Call(Call {
                id,
                module: module.to_string(),
                method: method.to_string(),
                payload,
            })),
        }
    }

    pub fn reply(id: u64, outcome: Result<Vec<u8>, String>) -> Self {
        let outcome = match outcome {
            Ok(payload) => reply::Outcome::Ok(payload),
            Err(message) => reply::Outcome::Error(message),
        };
        Self {
            kind: Some(frame::Kind::Reply(Reply {
                id,
                outcome: Some(outcome),
            })),
        }
    }

    pub fn event(topic: &str, payload: Vec<u8>, origin: &str) -> Self {
        Self {
            kind: Some(frame::Kind::Event(Event {
                topic: topic.to_string(),
                payload,
                origin: origin.to_string(),
            })),
        }
    }

    /// Short frame name for logging.
    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            Some(frame::Kind::Hello(_)) => "hello",
            Some(frame::Kind::Welcome(_)) => "welcome",
            Some(frame::Kind::Refused(_)) => "refused",
            Some(frame::Kind::Call(_)) => "call",
            Some(frame::Kind::Reply(_)) => "reply",
            Some(frame::Kind::Event(_)) => "event",
            None => "empty",
        }
    }
}
