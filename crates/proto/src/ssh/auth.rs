//! SSH authentication protocol (RFC 4252).
//!
//! This module implements the client side of user authentication:
//! - "publickey" - Ed25519 public key authentication with a signature
//! - "password" - Password authentication
//! - "none" - Used once to learn which methods the server accepts
//!
//! [`AuthMachine`] is a pure state machine. It decides which credential to
//! try next from the server's replies; the session performs the I/O.
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::auth::{AuthAction, AuthEvent, AuthMachine, AuthPolicy};
//!
//! let mut machine = AuthMachine::new(&["publickey", "password"], AuthPolicy::default()).unwrap();
//! assert_eq!(machine.handle(AuthEvent::Start).unwrap(), AuthAction::SendServiceRequest);
//! assert_eq!(machine.handle(AuthEvent::ServiceAccepted).unwrap(), AuthAction::QueryMethods);
//! ```

use bytes::{BufMut, BytesMut};
use skiff_platform::{SkiffError, SkiffResult};
use zeroize::{Zeroize, Zeroizing};

use crate::ssh::hostkey::{Ed25519Keypair, HostKey};
use crate::ssh::message::MessageType;
use crate::ssh::wire::{
    expect_message, read_bool, read_bytes, read_name_list, read_string, write_bool, write_bytes,
    write_name_list, write_string,
};

/// Service requested before authentication.
pub const USERAUTH_SERVICE: &str = "ssh-userauth";

/// Service started after authentication.
pub const CONNECTION_SERVICE: &str = "ssh-connection";

/// SSH_MSG_SERVICE_REQUEST (RFC 4253 Section 10).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRequest {
    /// Service name
    pub service_name: String,
}

impl ServiceRequest {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ServiceRequest as u8);
        write_string(&mut buf, &self.service_name);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        expect_message(data, MessageType::ServiceRequest as u8, "SERVICE_REQUEST")?;
        let mut offset = 1;
        Ok(Self {
            service_name: read_string(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_SERVICE_ACCEPT (RFC 4253 Section 10).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAccept {
    /// Service name
    pub service_name: String,
}

impl ServiceAccept {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ServiceAccept as u8);
        write_string(&mut buf, &self.service_name);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        expect_message(data, MessageType::ServiceAccept as u8, "SERVICE_ACCEPT")?;
        let mut offset = 1;
        Ok(Self {
            service_name: read_string(data, &mut offset)?,
        })
    }
}

/// SSH authentication method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// Asks for the list of methods that can continue.
    None,
    /// Password authentication.
    Password(String),
    /// Public key authentication.
    PublicKey {
        /// Algorithm name (e.g., "ssh-ed25519")
        algorithm: String,
        /// Public key blob
        public_key: Vec<u8>,
        /// Signature (if present)
        signature: Option<Vec<u8>>,
    },
}

impl AuthMethod {
    /// Returns the method name.
    pub fn name(&self) -> &str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::Password(_) => "password",
            AuthMethod::PublicKey { .. } => "publickey",
        }
    }
}

impl Drop for AuthMethod {
    fn drop(&mut self) {
        if let AuthMethod::Password(ref mut password) = self {
            password.zeroize();
        }
    }
}

/// SSH_MSG_USERAUTH_REQUEST message (RFC 4252 Section 5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    user_name: String,
    service_name: String,
    method: AuthMethod,
}

impl AuthRequest {
    /// Creates a new authentication request.
    ///
    /// # Example
    ///
    /// ```rust
    /// use skiff_proto::ssh::auth::{AuthMethod, AuthRequest};
    ///
    /// let request = AuthRequest::new("alice", "ssh-connection", AuthMethod::None);
    /// assert_eq!(request.method().name(), "none");
    /// ```
    pub fn new(user_name: &str, service_name: &str, method: AuthMethod) -> Self {
        Self {
            user_name: user_name.to_string(),
            service_name: service_name.to_string(),
            method,
        }
    }

    /// Returns the user name.
    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    /// Returns the service name.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Returns the authentication method.
    pub fn method(&self) -> &AuthMethod {
        &self.method
    }

    /// Serializes the authentication request to bytes.
    ///
    /// Format (RFC 4252 Section 5):
    /// ```text
    /// byte      SSH_MSG_USERAUTH_REQUEST (50)
    /// string    user name
    /// string    service name
    /// string    method name
    /// ....      method specific fields
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthRequest as u8);
        write_string(&mut buf, &self.user_name);
        write_string(&mut buf, &self.service_name);
        write_string(&mut buf, self.method.name());

        match &self.method {
            AuthMethod::None => {}
            AuthMethod::Password(password) => {
                // Not a password change
                write_bool(&mut buf, false);
                write_string(&mut buf, password);
            }
            AuthMethod::PublicKey {
                algorithm,
                public_key,
                signature,
            } => {
                write_bool(&mut buf, signature.is_some());
                write_string(&mut buf, algorithm);
                write_bytes(&mut buf, public_key);
                if let Some(sig) = signature {
                    write_bytes(&mut buf, sig);
                }
            }
        }

        buf.to_vec()
    }

    /// Parses an authentication request from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Protocol`] for an unknown method.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        expect_message(data, MessageType::UserauthRequest as u8, "USERAUTH_REQUEST")?;
        let mut offset = 1;

        let user_name = read_string(data, &mut offset)?;
        let service_name = read_string(data, &mut offset)?;
        let method_name = read_string(data, &mut offset)?;

        let method = match method_name.as_str() {
            "none" => AuthMethod::None,
            "password" => {
                let _changing = read_bool(data, &mut offset)?;
                AuthMethod::Password(read_string(data, &mut offset)?)
            }
            "publickey" => {
                let has_signature = read_bool(data, &mut offset)?;
                let algorithm = read_string(data, &mut offset)?;
                let public_key = read_bytes(data, &mut offset)?;
                let signature = if has_signature {
                    Some(read_bytes(data, &mut offset)?)
                } else {
                    None
                };
                AuthMethod::PublicKey {
                    algorithm,
                    public_key,
                    signature,
                }
            }
            _ => {
                return Err(SkiffError::Protocol(format!(
                    "Unsupported authentication method: '{}'",
                    method_name
                )))
            }
        };

        Ok(Self {
            user_name,
            service_name,
            method,
        })
    }
}

/// SSH_MSG_USERAUTH_FAILURE message (RFC 4252 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFailure {
    methods_can_continue: Vec<String>,
    partial_success: bool,
}

impl AuthFailure {
    /// Creates a new authentication failure message.
    pub fn new(methods: Vec<String>, partial_success: bool) -> Self {
        Self {
            methods_can_continue: methods,
            partial_success,
        }
    }

    /// Returns the methods that can continue.
    pub fn methods_can_continue(&self) -> &[String] {
        &self.methods_can_continue
    }

    /// Returns whether partial success was achieved.
    pub fn partial_success(&self) -> bool {
        self.partial_success
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthFailure as u8);
        write_name_list(&mut buf, &self.methods_can_continue);
        write_bool(&mut buf, self.partial_success);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        expect_message(data, MessageType::UserauthFailure as u8, "USERAUTH_FAILURE")?;
        let mut offset = 1;
        let methods_can_continue = read_name_list(data, &mut offset)?;
        let partial_success = read_bool(data, &mut offset)?;
        Ok(Self {
            methods_can_continue,
            partial_success,
        })
    }
}

/// SSH_MSG_USERAUTH_SUCCESS message (RFC 4252 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AuthSuccess;

impl AuthSuccess {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![MessageType::UserauthSuccess as u8]
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        expect_message(data, MessageType::UserauthSuccess as u8, "USERAUTH_SUCCESS")?;
        Ok(Self)
    }
}

/// SSH_MSG_USERAUTH_BANNER message (RFC 4252 Section 5.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthBanner {
    message: String,
}

impl AuthBanner {
    /// Creates a banner.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Returns the banner text.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthBanner as u8);
        write_string(&mut buf, &self.message);
        // language tag
        write_string(&mut buf, "");
        buf.to_vec()
    }

    /// Parses from bytes. The language tag is ignored.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        expect_message(data, MessageType::UserauthBanner as u8, "USERAUTH_BANNER")?;
        let mut offset = 1;
        Ok(Self {
            message: read_string(data, &mut offset)?,
        })
    }
}

/// Constructs the data to be signed for public key authentication (RFC 4252 Section 7).
///
/// # Format
///
/// ```text
/// string    session identifier
/// byte      SSH_MSG_USERAUTH_REQUEST (50)
/// string    user name
/// string    service name
/// string    "publickey"
/// boolean   TRUE (has signature)
/// string    public key algorithm name
/// string    public key blob
/// ```
pub fn construct_signature_data(
    session_id: &[u8],
    user_name: &str,
    service_name: &str,
    algorithm: &str,
    public_key_blob: &[u8],
) -> Vec<u8> {
    let mut buf = BytesMut::new();
    write_bytes(&mut buf, session_id);
    buf.put_u8(MessageType::UserauthRequest as u8);
    write_string(&mut buf, user_name);
    write_string(&mut buf, service_name);
    write_string(&mut buf, "publickey");
    write_bool(&mut buf, true);
    write_string(&mut buf, algorithm);
    write_bytes(&mut buf, public_key_blob);
    buf.to_vec()
}

/// One secret the client can authenticate with.
#[derive(Clone)]
pub enum Credential {
    /// Ed25519 private key
    PublicKey(Ed25519Keypair),
    /// Password
    Password(Zeroizing<String>),
}

impl Credential {
    /// Authentication method this credential is used with.
    pub fn method(&self) -> &'static str {
        match self {
            Credential::PublicKey(_) => "publickey",
            Credential::Password(_) => "password",
        }
    }

    /// Builds the USERAUTH_REQUEST presenting this credential.
    ///
    /// Public keys are signed over `session_id` right away.
    pub fn request(&self, user: &str, session_id: &[u8]) -> SkiffResult<Vec<u8>> {
        let method = match self {
            Credential::PublicKey(key) => {
                let algorithm = key.algorithm().name().to_string();
                let public_key = key.public_key_blob();
                let data = construct_signature_data(
                    session_id,
                    user,
                    CONNECTION_SERVICE,
                    &algorithm,
                    &public_key,
                );
                AuthMethod::PublicKey {
                    signature: Some(key.sign(&data)?),
                    algorithm,
                    public_key,
                }
            }
            Credential::Password(password) => AuthMethod::Password(password.to_string()),
        };
        Ok(AuthRequest::new(user, CONNECTION_SERVICE, method).to_bytes())
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::PublicKey(key) => f.debug_tuple("PublicKey").field(key).finish(),
            Credential::Password(_) => f.write_str("Password(<redacted>)"),
        }
    }
}

/// A user name and the credentials to try for it.
#[derive(Debug, Clone)]
pub struct Credentials {
    user: String,
    list: Vec<Credential>,
}

impl Credentials {
    /// Starts an empty credential set for `user`.
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            list: Vec::new(),
        }
    }

    /// Adds a private key.
    pub fn with_key(mut self, key: Ed25519Keypair) -> Self {
        self.list.push(Credential::PublicKey(key));
        self
    }

    /// Adds a password.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.list.push(Credential::Password(Zeroizing::new(password.into())));
        self
    }

    /// User name.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Credentials in the order they were added.
    pub fn list(&self) -> &[Credential] {
        &self.list
    }

    /// Method name of each credential, in order.
    pub fn methods(&self) -> Vec<&'static str> {
        self.list.iter().map(Credential::method).collect()
    }
}

/// How credentials are chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPolicy {
    /// Methods in priority order; credentials for unlisted methods go last.
    pub method_order: Vec<String>,
    /// Skip credentials whose method the server did not list.
    pub skip_unadvertised: bool,
}

impl Default for AuthPolicy {
    fn default() -> Self {
        Self {
            method_order: vec!["publickey".to_string(), "password".to_string()],
            skip_unadvertised: false,
        }
    }
}

/// Authentication progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// Nothing sent yet
    Init,
    /// Service accepted; waiting for the list of methods
    MethodOffered,
    /// A credential is being tried
    Attempting {
        /// Index of the credential in flight
        credential: usize,
    },
    /// The server accepted a method but wants another one
    PartialSuccess {
        /// Index of the credential in flight
        credential: usize,
    },
    /// Done
    Authenticated,
    /// Every credential was rejected
    Exhausted,
}

/// Server reply fed into [`AuthMachine::handle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    /// Begin authentication
    Start,
    /// SERVICE_ACCEPT for "ssh-userauth"
    ServiceAccepted,
    /// USERAUTH_FAILURE
    Failure {
        /// Methods that can continue
        methods: Vec<String>,
        /// Partial success flag
        partial_success: bool,
    },
    /// USERAUTH_SUCCESS
    Success,
}

/// What the session must do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthAction {
    /// Send SERVICE_REQUEST "ssh-userauth"
    SendServiceRequest,
    /// Send a "none" request to learn the accepted methods
    QueryMethods,
    /// Present the credential at this index
    Attempt(usize),
    /// Authenticated
    Done,
    /// Fail with [`SkiffError::AuthExhausted`]
    GiveUp,
}

/// Pure authentication state machine.
#[derive(Debug, Clone)]
pub struct AuthMachine {
    state: AuthState,
    methods: Vec<&'static str>,
    queue: Vec<usize>,
    skip_unadvertised: bool,
    advertised: Vec<String>,
    attempted: Vec<String>,
}

impl AuthMachine {
    /// Creates a machine for credentials with the given method names.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Config`] if there are no credentials.
    pub fn new(methods: &[&'static str], policy: AuthPolicy) -> SkiffResult<Self> {
        if methods.is_empty() {
            return Err(SkiffError::Config("No credentials configured".to_string()));
        }

        let rank = |method: &str| {
            policy
                .method_order
                .iter()
                .position(|m| m == method)
                .unwrap_or(policy.method_order.len())
        };
        let mut queue: Vec<usize> = (0..methods.len()).collect();
        queue.sort_by_key(|&i| rank(methods[i]));

        Ok(Self {
            state: AuthState::Init,
            methods: methods.to_vec(),
            queue,
            skip_unadvertised: policy.skip_unadvertised,
            advertised: Vec::new(),
            attempted: Vec::new(),
        })
    }

    /// Current state.
    pub fn state(&self) -> AuthState {
        self.state
    }

    /// Methods tried so far, in order.
    pub fn attempted(&self) -> &[String] {
        &self.attempted
    }

    fn next_attempt(&mut self, partial: bool) -> AuthAction {
        while !self.queue.is_empty() {
            let credential = self.queue.remove(0);
            let method = self.methods[credential];
            if self.skip_unadvertised && !self.advertised.iter().any(|m| m == method) {
                continue;
            }
            self.attempted.push(method.to_string());
            self.state = if partial {
                AuthState::PartialSuccess { credential }
            } else {
                AuthState::Attempting { credential }
            };
            return AuthAction::Attempt(credential);
        }
        self.state = AuthState::Exhausted;
        AuthAction::GiveUp
    }

    /// Applies one event and returns the next action.
    ///
    /// A failure while attempting returns the machine to `MethodOffered`
    /// with the rejected credential removed from the queue, and the next
    /// credential is chosen in the same step. The state after the call is
    /// therefore `Attempting`, `PartialSuccess` or `Exhausted`, never the
    /// intermediate `MethodOffered`.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Protocol`] for a reply that does not fit the
    /// current state.
    pub fn handle(&mut self, event: AuthEvent) -> SkiffResult<AuthAction> {
        use AuthState as S;

        let action = match (self.state, event) {
            (S::Init, AuthEvent::Start) => AuthAction::SendServiceRequest,
            (S::Init, AuthEvent::ServiceAccepted) => {
                self.state = S::MethodOffered;
                AuthAction::QueryMethods
            }
            (S::MethodOffered, AuthEvent::Failure { methods, .. }) => {
                self.advertised = methods;
                self.next_attempt(false)
            }
            (
                S::Attempting { .. } | S::PartialSuccess { .. },
                AuthEvent::Failure {
                    methods,
                    partial_success,
                },
            ) => {
                self.state = S::MethodOffered;
                self.advertised = methods;
                self.next_attempt(partial_success)
            }
            (
                S::MethodOffered | S::Attempting { .. } | S::PartialSuccess { .. },
                AuthEvent::Success,
            ) => {
                self.state = S::Authenticated;
                AuthAction::Done
            }
            (state, event) => {
                return Err(SkiffError::Protocol(format!(
                    "Unexpected authentication event {:?} in state {:?}",
                    event, state
                )))
            }
        };

        Ok(action)
    }

    /// Method of the credential in flight, if any.
    pub fn in_flight(&self) -> Option<&'static str> {
        match self.state {
            AuthState::Attempting { credential } | AuthState::PartialSuccess { credential } => {
                Some(self.methods[credential])
            }
            _ => None,
        }
    }
}

/// Result of a successful authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthOutcome {
    /// Method that completed authentication ("none" if no credential was needed)
    pub method: String,
    /// Methods attempted, in order
    pub attempted: Vec<String>,
    /// Banners the server sent
    pub banners: Vec<String>,
}
