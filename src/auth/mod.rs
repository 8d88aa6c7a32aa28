//! Key loading and credential resolution for the jump host

pub mod keys;
mod resolver;

pub use keys::{default_key_paths, expand_tilde, first_default_key, load_private_key, KeyError};
pub use resolver::{
    AuthError, AuthResolver, Credential, CredentialSource, PassphrasePrompt, PromptResponse,
    MAX_PROMPT_ATTEMPTS,
};
