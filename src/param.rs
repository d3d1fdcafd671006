//! パラメータ値の書き換えと、ホスト側へのデータ転送。

use crate::error::{PinnError, PinnResult};
use burn::module::Param;
use burn::prelude::Backend;
use burn::tensor::{Tensor, TensorData};

/// パラメータへの書き込み中だけ自動微分の追跡を止めるスコープ。
///
/// 生成時に値を `detach` し、破棄時に元の `require_grad` を戻します。
/// 途中で `?` により抜けた場合も `Drop` で復元されます。
/// `ParamId` は書き換えの前後で変わりません。
pub struct NoGradScope<'a, B: Backend, const D: usize> {
    param: &'a mut Param<Tensor<B, D>>,
    require_grad: bool,
}

impl<'a, B: Backend, const D: usize> NoGradScope<'a, B, D> {
    pub fn new(param: &'a mut Param<Tensor<B, D>>) -> Self {
        let value = param.val();
        let require_grad = value.is_require_grad();
        *param = Param::initialized(param.id, value.detach());
        Self {
            param,
            require_grad,
        }
    }

    pub fn dims(&self) -> [usize; D] {
        self.param.val().dims()
    }

    pub fn device(&self) -> B::Device {
        self.param.val().device()
    }

    /// 追跡を止めた状態で値を差し替えます。
    pub fn write(&mut self, value: Tensor<B, D>) {
        *self.param = Param::initialized(self.param.id, value.detach());
    }
}

impl<B: Backend, const D: usize> Drop for NoGradScope<'_, B, D> {
    fn drop(&mut self) {
        let value = self.param.val().set_require_grad(self.require_grad);
        *self.param = Param::initialized(self.param.id, value);
    }
}

/// テンソルを `f32` のベクタとしてホストへ取り出します。
pub fn to_host<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> PinnResult<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| PinnError::tensor(format!("{e:?}")))
}

/// ホストの値で `param` を上書きし、`flat` 上の次の読み出し位置を返します。
pub fn overwrite<B: Backend, const D: usize>(
    param: &mut Param<Tensor<B, D>>,
    flat: &[f32],
    offset: usize,
) -> PinnResult<usize> {
    let mut scope = NoGradScope::new(param);
    let dims = scope.dims();
    let end = offset + dims.iter().product::<usize>();
    if end > flat.len() {
        return Err(PinnError::shape(format!(
            "flat parameter vector has {} values, need at least {end}",
            flat.len()
        )));
    }
    let data = TensorData::new(flat[offset..end].to_vec(), dims);
    let value = Tensor::from_data(data, &scope.device());
    scope.write(value);
    Ok(end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = Autodiff<NdArray<f32>>;

    #[test]
    fn scope_restores_require_grad_and_keeps_id() {
        let device = Default::default();
        let mut param = Param::from_tensor(Tensor::<TestBackend, 2>::zeros([2, 3], &device));
        let id = param.id;
        assert!(param.val().is_require_grad());

        {
            let mut scope = NoGradScope::new(&mut param);
            assert_eq!(scope.dims(), [2, 3]);
            scope.write(Tensor::ones([2, 3], &device));
        }

        assert_eq!(param.id, id);
        assert!(param.val().is_require_grad());
        assert_eq!(to_host(param.val()).unwrap(), vec![1.0; 6]);
    }

    #[test]
    fn scope_restores_on_early_exit() {
        fn failing(param: &mut Param<Tensor<TestBackend, 1>>) -> PinnResult<()> {
            let _scope = NoGradScope::new(param);
            Err(PinnError::shape("boom"))
        }

        let device = Default::default();
        let mut param = Param::from_tensor(Tensor::<TestBackend, 1>::zeros([4], &device));
        assert!(failing(&mut param).is_err());
        assert!(param.val().is_require_grad());
    }

    #[test]
    fn overwrite_reads_consecutive_slices() {
        let device = Default::default();
        let mut a = Param::from_tensor(Tensor::<TestBackend, 2>::zeros([2, 2], &device));
        let mut b = Param::from_tensor(Tensor::<TestBackend, 1>::zeros([2], &device));
        let flat = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];

        let next = overwrite(&mut a, &flat, 0).unwrap();
        let end = overwrite(&mut b, &flat, next).unwrap();

        assert_eq!(end, 6);
        assert_eq!(to_host(a.val()).unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(to_host(b.val()).unwrap(), vec![5.0, 6.0]);
        assert!(overwrite(&mut b, &flat, 5).is_err());
    }
}
