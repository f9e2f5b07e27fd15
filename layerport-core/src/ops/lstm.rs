use crate::{
    attributes::Attributes,
    backend::{BinaryOp, ComputeBackend},
    descriptor::NodeDescriptor,
    dtype::TensorData,
    layer::LayerKind,
    roles::RoleTable,
    check, ConstantTensor, Dim, Error, Result, Tensor, TensorLayout, TensorShape,
};

use super::{LayerOperator, MaterializeContext, NodeIo, OpHeader, Operands, Operator};

/// `X` is `[seq_length, batch_size, input_size]`.
const INPUT_DIMS: [Dim; 3] = [Dim::BatchLength, Dim::BatchWidth, Dim::Channels];

/// `Y` is `[seq_length, num_directions = 1, batch_size, hidden_size]`.
const OUTPUT_DIMS: [Dim; 4] = [Dim::BatchLength, Dim::ListSize, Dim::BatchWidth, Dim::Channels];

/// For each runtime gate block, the index of the `i, o, f, c` block it is
/// taken from.
const GATE_ORDER: [usize; 4] = [3, 2, 0, 1];

const DEFAULT_ACTIVATIONS: [&str; 3] = ["Sigmoid", "Tanh", "Tanh"];

/// Regroups the four gate blocks of `block` values each into runtime order.
fn reorder_gates(data: &[f32], block: usize) -> Vec<f32> {
    GATE_ORDER
        .iter()
        .flat_map(|g| &data[g * block..(g + 1) * block])
        .copied()
        .collect()
}

/// One-direction `LSTM` that produces the full output sequence.
///
/// The hidden and cell state outputs, sequence lengths and peepholes are not
/// supported. Initial states are accepted only when they are all zeros.
#[derive(Debug, Clone)]
pub struct Lstm {
    header: OpHeader,
    hidden_size: usize,
    reverse: bool,
}

impl Lstm {
    pub fn build(node: &NodeDescriptor, opset: i64) -> Result<Operator> {
        let header = OpHeader::from_node(node, opset);
        header.check_arity(node, (3, 8), (1, 3))?;
        if node.outputs[0].is_empty() || node.outputs.iter().skip(1).any(|o| !o.is_empty()) {
            return Err(Error::unsupported(&header, "outputs other than the sequence Y"));
        }
        let attrs = Attributes::new(node);
        let hidden_size = attrs.get_required::<i64>("hidden_size")?;
        check!(hidden_size > 0, malformed, header, "hidden_size {hidden_size} must be positive");
        let reverse = match attrs.get_optional("direction", String::from("forward"))?.as_str() {
            "forward" => false,
            "reverse" => true,
            "bidirectional" => return Err(Error::unsupported(&header, "bidirectional LSTM")),
            other => return Err(Error::malformed(&header, format!("unknown direction '{other}'"))),
        };
        let activations = attrs.get_optional("activations", Vec::<String>::new())?;
        if !activations.is_empty() && activations.iter().map(String::as_str).ne(DEFAULT_ACTIVATIONS) {
            return Err(Error::unsupported(&header, format!("activations {activations:?}")));
        }
        if attrs.has("clip") {
            return Err(Error::unsupported(&header, "cell clipping"));
        }
        if attrs.get_optional("input_forget", 0i64)? != 0 {
            return Err(Error::unsupported(&header, "coupled input and forget gates"));
        }
        if attrs.get_optional("layout", 0i64)? != 0 {
            return Err(Error::unsupported(&header, "batch-major layout"));
        }
        Ok(Operator::Lstm(Self {
            header,
            hidden_size: hidden_size as usize,
            reverse,
        }))
    }

    /// A `[1, 4 * hidden, n]` weight input as a `[BatchWidth, Channels]`
    /// matrix with the gate blocks reordered.
    fn gate_matrix(&self, weights: &ConstantTensor) -> Result<ConstantTensor> {
        let (rows, cols) = (weights.shape()[1], weights.shape()[2]);
        let data = reorder_gates(&weights.to_f32_vec(), self.hidden_size * cols);
        ConstantTensor::new(
            [rows, cols],
            TensorLayout::new(vec![Dim::BatchWidth, Dim::Channels])?,
            data,
        )
    }

    /// The input and recurrent halves of a `[1, 8 * hidden]` bias, summed.
    fn free_term(&self, bias: &ConstantTensor, backend: &dyn ComputeBackend) -> Result<ConstantTensor> {
        let width = 4 * self.hidden_size;
        let values = bias.to_f32_vec();
        let (input, recurrent) = values.split_at(width);
        let sum = backend.binary(
            BinaryOp::Add,
            &TensorData::Float(reorder_gates(input, self.hidden_size)),
            &TensorData::Float(reorder_gates(recurrent, self.hidden_size)),
        )?;
        ConstantTensor::new([width], TensorLayout::new(vec![Dim::Channels])?, sum)
    }
}

impl LayerOperator for Lstm {
    fn header(&self) -> &OpHeader {
        &self.header
    }

    fn output_shapes(&self, inputs: &Operands<'_>) -> Result<Vec<TensorShape>> {
        let x = inputs.shape(0)?;
        check!(
            x.rank() == 3,
            malformed,
            self.header,
            "input {x} is not [seq_length, batch_size, input_size]"
        );
        let h = self.hidden_size;
        for (index, what, cols) in [(1, "input weights", x[2]), (2, "recurrent weights", h)] {
            let w = inputs.shape(index)?;
            check!(
                w.dims() == [1, 4 * h, cols],
                malformed,
                self.header,
                "{what} {w} do not match [1, {}, {cols}]",
                4 * h
            );
        }
        if let Some(b) = inputs.optional(3) {
            check!(
                b.shape.dims() == [1, 8 * h],
                malformed,
                self.header,
                "bias {} does not match [1, {}]",
                b.shape,
                8 * h
            );
        }
        for index in [5, 6] {
            if let Some(state) = inputs.optional(index) {
                check!(
                    state.shape.dims() == [1, x[1], h],
                    malformed,
                    self.header,
                    "initial state {} does not match [1, {}, {h}]",
                    state.shape,
                    x[1]
                );
            }
        }
        Ok(vec![TensorShape::from([x[0], 1, x[1], h])])
    }

    fn propagate_roles(&self, io: &NodeIo, table: &mut RoleTable) -> Result<()> {
        table.require_layout(&self.header, io.output(0)?, &OUTPUT_DIMS)?;
        if let Some(x) = io.input(0) {
            table.require_layout(&self.header, x, &INPUT_DIMS)?;
        }
        Ok(())
    }

    fn materialize(&self, ctx: &mut MaterializeContext<'_>) -> Result<Vec<Tensor>> {
        for (index, what) in [(4, "sequence lengths"), (7, "peepholes")] {
            if ctx.optional_input(index).is_some() {
                return Err(Error::unsupported(ctx.header(), what));
            }
        }
        for (index, what) in [(5, "initial hidden state"), (6, "initial cell state")] {
            if let Some(state) = ctx.optional_constant_input(index, what)? {
                if state.to_f32_vec().iter().any(|v| *v != 0.) {
                    return Err(Error::unsupported(ctx.header(), format!("non-zero {what}")));
                }
            }
        }
        let input_weights = self.gate_matrix(ctx.constant_input(1, "input weights")?)?;
        let recurrent_weights = self.gate_matrix(ctx.constant_input(2, "recurrent weights")?)?;
        let free_term = match ctx.optional_constant_input(3, "bias")? {
            Some(b) => Some(self.free_term(b, ctx.backend())?),
            None => None,
        };

        let x = ctx.input_as(0, &TensorLayout::new(INPUT_DIMS.to_vec())?)?;
        let kind = LayerKind::Lstm {
            hidden_size: self.hidden_size,
            input_weights,
            recurrent_weights,
            free_term,
            reverse: self.reverse,
        };
        let id = ctx.add_layer(None, kind, vec![x.output()])?;
        let out_shape = ctx.output_shape(0)?.clone();
        let layout = TensorLayout::new(OUTPUT_DIMS.to_vec())?;
        Ok(vec![ctx.layer_output(id, out_shape, layout)?.into()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backend::CpuBackend, ErrorKind};

    fn node() -> NodeDescriptor {
        NodeDescriptor::new("LSTM", "rnn")
            .input("x")
            .input("w")
            .input("r")
            .output("y")
            .attr("hidden_size", 1i64)
    }

    fn lstm(node: &NodeDescriptor) -> Lstm {
        let Operator::Lstm(lstm) = Lstm::build(node, 11).unwrap() else {
            panic!()
        };
        lstm
    }

    #[test]
    fn gates_move_to_runtime_order() {
        // i, o, f, c rows of a [1, 4, 2] weight
        let w = ConstantTensor::from_data([1, 4, 2], vec![0f32, 1., 10., 11., 20., 21., 30., 31.]).unwrap();
        let matrix = lstm(&node()).gate_matrix(&w).unwrap();
        assert_eq!(matrix.shape(), &TensorShape::from([4, 2]));
        assert_eq!(matrix.to_f32_vec(), vec![30., 31., 20., 21., 0., 1., 10., 11.]);
    }

    #[test]
    fn bias_halves_are_summed() {
        let b = ConstantTensor::from_data([1, 8], vec![1f32, 2., 3., 4., 10., 20., 30., 40.]).unwrap();
        let free_term = lstm(&node()).free_term(&b, &CpuBackend).unwrap();
        assert_eq!(free_term.to_f32_vec(), vec![44., 33., 11., 22.]);
    }

    #[test]
    fn unsupported_configurations() {
        let bidirectional = node().attr("direction", "bidirectional");
        assert_eq!(Lstm::build(&bidirectional, 11).unwrap_err().kind(), ErrorKind::Unsupported);
        let state_output = node().output("y_h");
        assert_eq!(Lstm::build(&state_output, 11).unwrap_err().kind(), ErrorKind::Unsupported);
        let relu = node().attr(
            "activations",
            vec!["Relu".to_string(), "Tanh".to_string(), "Tanh".to_string()],
        );
        assert_eq!(Lstm::build(&relu, 11).unwrap_err().kind(), ErrorKind::Unsupported);
        assert!(lstm(&node().attr("direction", "reverse")).reverse);
    }

    #[test]
    fn hidden_size_is_required() {
        let node = NodeDescriptor::new("LSTM", "rnn").input("x").input("w").input("r").output("y");
        assert_eq!(Lstm::build(&node, 11).unwrap_err().kind(), ErrorKind::Malformed);
    }
}
