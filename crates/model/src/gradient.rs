//! Scoped model state for gradient computation.

use std::ops::{Deref, DerefMut};

use tracing::trace;

use crate::backend::{ModelMode, QueryModel};

/// Gradient of the loss with respect to the input-embedding layer's output
/// for one example.
#[derive(Debug, Clone, PartialEq)]
pub struct GradientResult {
    pub ids: Vec<u32>,
    /// `[seq_len][embedding_dim]`
    pub gradient: Vec<Vec<f32>>,
}

/// Puts a model in train mode with a trainable embedding layer for as long as
/// it is alive, and restores the previous mode and trainability on drop.
pub struct GradientSession<'m, M: QueryModel + ?Sized> {
    model: &'m mut M,
    prior_mode: ModelMode,
    prior_trainable: bool,
}

impl<'m, M: QueryModel + ?Sized> GradientSession<'m, M> {
    pub fn enter(model: &'m mut M) -> Self {
        let prior_mode = model.mode();
        let prior_trainable = model.embedding_trainable();
        model.set_mode(ModelMode::Train);
        model.set_embedding_trainable(true);
        trace!(?prior_mode, prior_trainable, "gradient session entered");
        Self {
            model,
            prior_mode,
            prior_trainable,
        }
    }
}

impl<M: QueryModel + ?Sized> Deref for GradientSession<'_, M> {
    type Target = M;

    fn deref(&self) -> &M {
        &*self.model
    }
}

impl<M: QueryModel + ?Sized> DerefMut for GradientSession<'_, M> {
    fn deref_mut(&mut self) -> &mut M {
        &mut *self.model
    }
}

impl<M: QueryModel + ?Sized> Drop for GradientSession<'_, M> {
    fn drop(&mut self) {
        self.model.set_embedding_trainable(self.prior_trainable);
        self.model.set_mode(self.prior_mode);
        trace!("gradient session restored model state");
    }
}
