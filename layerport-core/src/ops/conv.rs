use crate::{
    attributes::Attributes,
    descriptor::NodeDescriptor,
    dtype::DataType,
    error::ErrorSite,
    layer::{ConvParams, LayerKind},
    roles::RoleTable,
    Dim, Error, Result, Tensor, TensorLayout, TensorShape,
};

use super::{spatial_layout, LayerOperator, MaterializeContext, NodeIo, OpHeader, Operands, Operator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AutoPad {
    NotSet,
    Valid,
    SameUpper,
    SameLower,
}

impl AutoPad {
    fn parse<S: ErrorSite + ?Sized>(site: &S, value: &str) -> Result<Self> {
        match value {
            "NOTSET" => Ok(Self::NotSet),
            "VALID" => Ok(Self::Valid),
            "SAME_UPPER" => Ok(Self::SameUpper),
            "SAME_LOWER" => Ok(Self::SameLower),
            other => Err(Error::malformed(site, format!("unknown auto_pad {other:?}"))),
        }
    }
}

/// Sliding-window attributes shared by convolution and pooling.
#[derive(Debug, Clone)]
pub(crate) struct Window {
    kernel: Option<Vec<usize>>,
    strides: Option<Vec<usize>>,
    dilations: Option<Vec<usize>>,
    pads: Option<Vec<usize>>,
    auto_pad: AutoPad,
}

/// A window resolved against concrete spatial extents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResolvedWindow {
    pub kernel: Vec<usize>,
    pub strides: Vec<usize>,
    pub dilations: Vec<usize>,
    pub pads_begin: Vec<usize>,
    pub pads_end: Vec<usize>,
    pub output: Vec<usize>,
}

fn non_negative<S: ErrorSite + ?Sized>(site: &S, what: &str, values: Vec<i64>) -> Result<Vec<usize>> {
    values
        .into_iter()
        .map(|v| {
            usize::try_from(v).map_err(|_| Error::malformed(site, format!("negative {what} {v}")))
        })
        .collect()
}

impl Window {
    pub(crate) fn read(header: &OpHeader, attrs: &Attributes<'_>) -> Result<Self> {
        let list = |name: &str| -> Result<Option<Vec<usize>>> {
            attrs
                .get::<Vec<i64>>(name)?
                .map(|v| non_negative(header, name, v))
                .transpose()
        };
        let auto_pad = AutoPad::parse(header, &attrs.get_optional("auto_pad", "NOTSET".to_string())?)?;
        Ok(Self {
            kernel: list("kernel_shape")?,
            strides: list("strides")?,
            dilations: list("dilations")?,
            pads: list("pads")?,
            auto_pad,
        })
    }

    pub(crate) fn kernel(&self) -> Option<&[usize]> {
        self.kernel.as_deref()
    }

    pub(crate) fn dilations(&self) -> Option<&[usize]> {
        self.dilations.as_deref()
    }

    /// Resolve against the spatial extents of the input. `kernel` is used
    /// when the node has no `kernel_shape` attribute.
    pub(crate) fn resolve(
        &self,
        header: &OpHeader,
        input: &[usize],
        kernel: Option<&[usize]>,
    ) -> Result<ResolvedWindow> {
        let n = input.len();
        let kernel = match (&self.kernel, kernel) {
            (Some(attr), Some(k)) if attr.as_slice() != k => {
                return Err(Error::malformed(
                    header,
                    format!("kernel_shape {attr:?} does not match weights {k:?}"),
                ))
            }
            (Some(attr), _) => attr.clone(),
            (None, Some(k)) => k.to_vec(),
            (None, None) => return Err(Error::malformed(header, "missing kernel_shape")),
        };
        let sized = |name: &str, v: Option<&Vec<usize>>, len: usize| -> Result<Vec<usize>> {
            match v {
                None => Ok(vec![if name == "pads" { 0 } else { 1 }; len]),
                Some(v) if v.len() == len => Ok(v.clone()),
                Some(v) => Err(Error::malformed(
                    header,
                    format!("{name} has {} values, expected {len}", v.len()),
                )),
            }
        };
        let kernel = sized("kernel_shape", Some(&kernel), n)?;
        let strides = sized("strides", self.strides.as_ref(), n)?;
        let dilations = sized("dilations", self.dilations.as_ref(), n)?;
        if strides.contains(&0) || dilations.contains(&0) || kernel.contains(&0) {
            return Err(Error::malformed(header, "zero kernel, stride or dilation"));
        }
        let effective: Vec<usize> = (0..n).map(|i| (kernel[i] - 1) * dilations[i] + 1).collect();

        let (pads_begin, pads_end) = match self.auto_pad {
            AutoPad::NotSet => {
                let pads = sized("pads", self.pads.as_ref(), 2 * n)?;
                (pads[..n].to_vec(), pads[n..].to_vec())
            }
            AutoPad::Valid => (vec![0; n], vec![0; n]),
            AutoPad::SameUpper | AutoPad::SameLower => {
                let mut begin = Vec::with_capacity(n);
                let mut end = Vec::with_capacity(n);
                for i in 0..n {
                    let out = input[i].div_ceil(strides[i]);
                    let total = ((out.max(1) - 1) * strides[i] + effective[i]).saturating_sub(input[i]);
                    let small = total / 2;
                    if self.auto_pad == AutoPad::SameUpper {
                        begin.push(small);
                        end.push(total - small);
                    } else {
                        begin.push(total - small);
                        end.push(small);
                    }
                }
                (begin, end)
            }
        };

        let mut output = Vec::with_capacity(n);
        for i in 0..n {
            let padded = input[i] + pads_begin[i] + pads_end[i];
            if padded < effective[i] {
                return Err(Error::malformed(
                    header,
                    format!(
                        "window of {} does not fit padded extent {padded}",
                        effective[i]
                    ),
                ));
            }
            output.push((padded - effective[i]) / strides[i] + 1);
        }
        Ok(ResolvedWindow {
            kernel,
            strides,
            dilations,
            pads_begin,
            pads_end,
            output,
        })
    }
}

impl ResolvedWindow {
    /// Height and width values; a 1-D window has unit width.
    pub(crate) fn hw(values: &[usize], fill: usize) -> [usize; 2] {
        [
            values.first().copied().unwrap_or(fill),
            values.get(1).copied().unwrap_or(fill),
        ]
    }

    /// Layers take one padding per axis.
    pub(crate) fn symmetric_pads(&self, header: &OpHeader) -> Result<[usize; 2]> {
        if self.pads_begin != self.pads_end {
            return Err(Error::unsupported(
                header,
                format!(
                    "asymmetric padding {:?} / {:?}",
                    self.pads_begin, self.pads_end
                ),
            ));
        }
        Ok(Self::hw(&self.pads_begin, 0))
    }
}

/// Shape `[N, C, spatial..]` of a windowed operator's output.
pub(crate) fn windowed_shape(input: &TensorShape, channels: usize, window: &ResolvedWindow) -> TensorShape {
    let mut dims = vec![input[0], channels];
    dims.extend_from_slice(&window.output);
    TensorShape::new(dims)
}

/// Pin `[BW, C, H(, W)]` on the data input and the output.
pub(crate) fn pin_spatial(header: &OpHeader, io: &NodeIo, table: &mut RoleTable) -> Result<()> {
    let output = io.output(0)?;
    let rank = table.shape(output)?.rank();
    let dims = spatial_layout(header, rank)?;
    if let Some(input) = io.input(0) {
        table.require_layout(header, input, &dims)?;
    }
    table.require_layout(header, output, &dims)
}

/// `Conv` with constant weights.
#[derive(Debug, Clone)]
pub struct Conv {
    header: OpHeader,
    group: usize,
    window: Window,
}

impl Conv {
    pub fn build(node: &NodeDescriptor, opset: i64) -> Result<Operator> {
        let header = OpHeader::from_node(node, opset);
        header.check_arity(node, (2, 3), (1, 1))?;
        let attrs = Attributes::new(node);
        let group = attrs.get_optional("group", 1i64)?;
        let group = usize::try_from(group)
            .ok()
            .filter(|g| *g > 0)
            .ok_or_else(|| Error::malformed(&header, format!("invalid group {group}")))?;
        let window = Window::read(&header, &attrs)?;
        Ok(Operator::Conv(Self {
            header,
            group,
            window,
        }))
    }

    fn resolve(&self, x: &TensorShape, w: &TensorShape) -> Result<ResolvedWindow> {
        if x.rank() < 3 || w.rank() != x.rank() {
            return Err(Error::malformed(
                &self.header,
                format!("input {x} and weights {w} do not form a convolution"),
            ));
        }
        if x[1] != w[1] * self.group {
            return Err(Error::malformed(
                &self.header,
                format!(
                    "input has {} channels but weights {w} with {} groups expect {}",
                    x[1],
                    self.group,
                    w[1] * self.group
                ),
            ));
        }
        self.window
            .resolve(&self.header, &x.dims()[2..], Some(&w.dims()[2..]))
    }
}

impl LayerOperator for Conv {
    fn header(&self) -> &OpHeader {
        &self.header
    }

    fn output_shapes(&self, inputs: &Operands<'_>) -> Result<Vec<TensorShape>> {
        let (x, w) = (inputs.shape(0)?, inputs.shape(1)?);
        let window = self.resolve(x, w)?;
        if let Some(b) = inputs.optional(2) {
            if b.shape.dims() != [w[0]] {
                return Err(Error::malformed(
                    &self.header,
                    format!("bias {} does not match {} filters", b.shape, w[0]),
                ));
            }
        }
        Ok(vec![windowed_shape(x, w[0], &window)])
    }

    fn propagate_roles(&self, io: &NodeIo, table: &mut RoleTable) -> Result<()> {
        pin_spatial(&self.header, io, table)
    }

    fn materialize(&self, ctx: &mut MaterializeContext<'_>) -> Result<Vec<Tensor>> {
        let out_shape = ctx.output_shape(0)?.clone();
        let layout = TensorLayout::new(spatial_layout(&self.header, out_shape.rank())?)?;
        let weights = ctx.constant_input(1, "convolution weights")?.cast(DataType::Float)?;
        let bias = match ctx.optional_constant_input(2, "convolution bias")? {
            Some(b) => Some(
                b.cast(DataType::Float)?
                    .to_layout(&TensorLayout::new(vec![Dim::Channels])?)?,
            ),
            None => None,
        };
        let x = ctx.input_as(0, &layout)?;
        let window = self.resolve(x.shape(), weights.shape())?;
        let pads = window.symmetric_pads(&self.header)?;

        let w = weights.shape();
        let mut filter_dims = w.dims().to_vec();
        filter_dims.resize(4, 1);
        let filter = weights.reshaped(filter_dims)?;
        let params = ConvParams {
            filter_count: w[0],
            kernel: ResolvedWindow::hw(&window.kernel, 1),
            strides: ResolvedWindow::hw(&window.strides, 1),
            pads,
            dilations: ResolvedWindow::hw(&window.dilations, 1),
        };

        let channels = x.shape()[1];
        let kind = if self.group == 1 {
            // [F, C, kh, kw] stored as [F, kh, kw, C]
            let filter_layout = TensorLayout::new(vec![
                Dim::BatchWidth,
                Dim::Channels,
                Dim::Height,
                Dim::Width,
            ])?;
            LayerKind::Conv {
                filter: filter.to_layout(&filter_layout)?,
                free_term: bias,
                params,
            }
        } else if self.group == channels && w[0] == channels && w[1] == 1 {
            // [C, 1, kh, kw] stored as [1, kh, kw, C]
            let filter_layout = TensorLayout::new(vec![
                Dim::Channels,
                Dim::BatchWidth,
                Dim::Height,
                Dim::Width,
            ])?;
            LayerKind::ChannelwiseConv {
                filter: filter.to_layout(&filter_layout)?,
                free_term: bias,
                params,
            }
        } else {
            return Err(Error::unsupported(
                &self.header,
                format!("grouped convolution with {} groups", self.group),
            ));
        };
        let id = ctx.add_layer(None, kind, vec![x.output()])?;
        Ok(vec![ctx.layer_output(id, out_shape, layout)?.into()])
    }
}
