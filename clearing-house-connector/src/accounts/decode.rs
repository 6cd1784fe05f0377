use crate::error::DecodeError;
use anchor_lang::AccountDeserialize;
use std::marker::PhantomData;

/// Turns raw account bytes into a typed record.
///
/// Any `Fn(&[u8]) -> Result<T, DecodeError>` closure is a decoder.
pub trait AccountDecoder<T>: Send + Sync {
    fn decode(&self, data: &[u8]) -> Result<T, DecodeError>;
}

impl<T, F> AccountDecoder<T> for F
where
    F: Fn(&[u8]) -> Result<T, DecodeError> + Send + Sync,
{
    fn decode(&self, data: &[u8]) -> Result<T, DecodeError> {
        self(data)
    }
}

/// Decodes Anchor program accounts, checking the 8-byte discriminator.
pub struct AnchorAccountDecoder<T>(PhantomData<fn() -> T>);

impl<T> AnchorAccountDecoder<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for AnchorAccountDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: AccountDeserialize> AccountDecoder<T> for AnchorAccountDecoder<T> {
    fn decode(&self, data: &[u8]) -> Result<T, DecodeError> {
        T::try_deserialize(&mut &data[..]).map_err(|err| match err {
            anchor_lang::error::Error::AnchorError(anchor_err)
                if anchor_err.error_name == "AccountDiscriminatorMismatch" =>
            {
                DecodeError::DiscriminatorMismatch
            }
            other => DecodeError::Invalid(other.to_string()),
        })
    }
}
