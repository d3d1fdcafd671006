use super::{Mode, TrainingState};
use std::ops::{Deref, DerefMut};

/// 評価の間だけ状態を推論モードにするスコープ。
///
/// 破棄時に元のモードへ戻すので、評価がエラーで抜けても学習モードは復元されます。
pub struct InferenceScope<'a, M, O> {
    state: &'a mut TrainingState<M, O>,
    previous: Mode,
}

impl<'a, M, O> InferenceScope<'a, M, O> {
    pub fn new(state: &'a mut TrainingState<M, O>) -> Self {
        let previous = state.mode();
        state.set_mode(Mode::Eval);
        Self { state, previous }
    }
}

impl<M, O> Deref for InferenceScope<'_, M, O> {
    type Target = TrainingState<M, O>;

    fn deref(&self) -> &Self::Target {
        self.state
    }
}

impl<M, O> DerefMut for InferenceScope<'_, M, O> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.state
    }
}

impl<M, O> Drop for InferenceScope<'_, M, O> {
    fn drop(&mut self) {
        self.state.set_mode(self.previous);
    }
}
