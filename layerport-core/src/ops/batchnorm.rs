use crate::{
    attributes::Attributes,
    backend::{BinaryOp, ComputeBackend, UnaryOp},
    descriptor::NodeDescriptor,
    dtype::{DataType, TensorData},
    layer::LayerKind,
    roles::RoleTable,
    check, ConstantTensor, Dim, Error, Result, Tensor, TensorLayout, TensorShape,
};

use super::{LayerOperator, MaterializeContext, NodeIo, OpHeader, Operands, Operator};

/// Inference-mode `BatchNormalization` with constant statistics.
#[derive(Debug, Clone)]
pub struct BatchNorm {
    header: OpHeader,
    epsilon: f32,
}

impl BatchNorm {
    pub fn build(node: &NodeDescriptor, opset: i64) -> Result<Operator> {
        let header = OpHeader::from_node(node, opset);
        header.check_arity(node, (5, 5), (1, 5))?;
        if node.outputs.iter().skip(1).any(|o| !o.is_empty()) {
            return Err(Error::unsupported(&header, "training-mode statistics outputs"));
        }
        let attrs = Attributes::new(node);
        if opset <= 6 && attrs.get_optional("is_test", 0i64)? == 0 {
            return Err(Error::unsupported(&header, "training mode"));
        }
        let epsilon = attrs.get_optional("epsilon", 1e-5f32)?;
        Ok(Operator::BatchNorm(Self { header, epsilon }))
    }

    /// Per-channel `gamma = scale / sqrt(var + eps)` and
    /// `beta = bias - mean * gamma`.
    fn coefficients(
        &self,
        stats: [&ConstantTensor; 4],
        backend: &dyn ComputeBackend,
    ) -> Result<(ConstantTensor, ConstantTensor)> {
        let [scale, bias, mean, var] = stats.map(|t| t.data().cast(DataType::Float));
        let channels = scale.len();
        let eps = TensorData::Float(vec![self.epsilon; channels]);
        let denom = backend.unary(
            UnaryOp::Reciprocal,
            &backend.unary(UnaryOp::Sqrt, &backend.binary(BinaryOp::Add, &var, &eps)?)?,
        )?;
        let gamma = backend.binary(BinaryOp::Mul, &scale, &denom)?;
        let shifted = backend.binary(BinaryOp::Mul, &mean, &gamma)?;
        let beta = backend.binary(BinaryOp::Sub, &bias, &shifted)?;
        let layout = TensorLayout::new(vec![Dim::Channels])?;
        Ok((
            ConstantTensor::new([channels], layout.clone(), gamma)?,
            ConstantTensor::new([channels], layout, beta)?,
        ))
    }
}

impl LayerOperator for BatchNorm {
    fn header(&self) -> &OpHeader {
        &self.header
    }

    fn output_shapes(&self, inputs: &Operands<'_>) -> Result<Vec<TensorShape>> {
        let x = inputs.shape(0)?;
        check!(x.rank() >= 2, malformed, self.header, "input {x} has no channel axis");
        for i in 1..5 {
            let s = inputs.shape(i)?;
            check!(
                s.dims() == [x[1]],
                malformed,
                self.header,
                "statistics input {i} of shape {s} does not match {} channels",
                x[1]
            );
        }
        Ok(vec![x.clone()])
    }

    fn propagate_roles(&self, io: &NodeIo, table: &mut RoleTable) -> Result<()> {
        let output = io.output(0)?;
        table.require(&self.header, output, 1, Dim::Channels)?;
        if let Some(input) = io.input(0) {
            table.require(&self.header, input, 1, Dim::Channels)?;
            table.link(&self.header, input, output)?;
        }
        Ok(())
    }

    fn materialize(&self, ctx: &mut MaterializeContext<'_>) -> Result<Vec<Tensor>> {
        let mut stats = Vec::with_capacity(4);
        for (i, what) in ["scale", "bias", "mean", "variance"].iter().enumerate() {
            stats.push(ctx.constant_input(i + 1, what)?.clone());
        }
        let (gamma, beta) =
            self.coefficients([&stats[0], &stats[1], &stats[2], &stats[3]], ctx.backend())?;
        let out_shape = ctx.output_shape(0)?.clone();
        let layout = ctx.output_layout(0)?.clone();
        let x = ctx.input_as(0, &layout)?;
        let id = ctx.add_layer(None, LayerKind::BatchNorm { gamma, beta }, vec![x.output()])?;
        Ok(vec![ctx.layer_output(id, out_shape, layout)?.into()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backend::CpuBackend, ErrorKind};

    fn node() -> NodeDescriptor {
        ["x", "s", "b", "m", "v"]
            .iter()
            .fold(NodeDescriptor::new("BatchNormalization", "bn"), |n, i| {
                n.input(*i)
            })
            .output("y")
    }

    #[test]
    fn coefficients_fold_statistics() {
        let Operator::BatchNorm(bn) = BatchNorm::build(&node().attr("epsilon", 0f32), 9).unwrap()
        else {
            panic!()
        };
        let scale = ConstantTensor::from_data([2], vec![2f32, 1.]).unwrap();
        let bias = ConstantTensor::from_data([2], vec![1f32, 0.]).unwrap();
        let mean = ConstantTensor::from_data([2], vec![3f32, -1.]).unwrap();
        let var = ConstantTensor::from_data([2], vec![4f32, 1.]).unwrap();
        let (gamma, beta) = bn
            .coefficients([&scale, &bias, &mean, &var], &CpuBackend)
            .unwrap();
        assert_eq!(gamma.to_f32_vec(), vec![1., 1.]);
        assert_eq!(beta.to_f32_vec(), vec![-2., 1.]);
    }

    #[test]
    fn training_mode_is_unsupported() {
        let err = BatchNorm::build(&node(), 6).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
        assert!(BatchNorm::build(&node().attr("is_test", 1i64), 6).is_ok());
        let training = node().output("mean_out");
        assert_eq!(
            BatchNorm::build(&training, 9).unwrap_err().kind(),
            ErrorKind::Unsupported
        );
    }
}
