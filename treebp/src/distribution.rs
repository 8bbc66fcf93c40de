use ndarray::{Array1, ArrayD, Axis, Ix1, IxDyn};
use thiserror::Error;

type Proba = f64;

/// Absolute tolerance used by the validity predicates.
pub const DEFAULT_TOLERANCE: Proba = 1e-9;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DistributionError {
    #[error("No axis named {0}.")]
    UnknownAxis(String),
    #[error("Cannot multiply along axis {axis}: {reason}.")]
    AxisMismatch { axis: String, reason: String },
    #[error("Table has rank {rank} but {labels} axis labels were given.")]
    Rank { rank: usize, labels: usize },
    #[error("Axis {0} is labeled more than once.")]
    DuplicateAxis(String),
    #[error("Probabilities must be finite and non-negative, found {0}.")]
    InvalidProbability(Proba),
}

type Result<T> = std::result::Result<T, DistributionError>;

/// A probability table whose axes are named after the variables they range over.
///
/// `probs.shape()[i]` is the number of states of the variable `axes[i]`.
/// Operations return new tables, except [`Distribution::multiply_assign`] which is only meant to
/// be applied to a private copy.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Distribution {
    probs: ArrayD<Proba>,
    axes: Vec<String>,
}

impl Distribution {
    pub fn new<S: Into<String>>(
        probs: ArrayD<Proba>,
        axes: impl IntoIterator<Item = S>,
    ) -> Result<Self> {
        let axes: Vec<String> = axes.into_iter().map(Into::into).collect();
        if probs.ndim() != axes.len() {
            return Err(DistributionError::Rank {
                rank: probs.ndim(),
                labels: axes.len(),
            });
        }
        for (i, a) in axes.iter().enumerate() {
            if axes[..i].contains(a) {
                return Err(DistributionError::DuplicateAxis(a.clone()));
            }
        }
        if let Some(p) = probs.iter().find(|p| !p.is_finite() || **p < 0.0) {
            return Err(DistributionError::InvalidProbability(*p));
        }
        Ok(Self { probs, axes })
    }
    /// Single-axis table over `axis`.
    pub fn from_vector(probs: Array1<Proba>, axis: impl Into<String>) -> Result<Self> {
        Self::new(probs.into_dyn(), std::iter::once(axis))
    }
    /// Rank-0 table.
    pub fn scalar(value: Proba) -> Result<Self> {
        Self::new(
            ArrayD::from_elem(IxDyn(&[]), value),
            std::iter::empty::<String>(),
        )
    }
    pub fn probs(&self) -> &ArrayD<Proba> {
        &self.probs
    }
    pub fn axes(&self) -> &[String] {
        self.axes.as_slice()
    }
    pub fn shape(&self) -> &[usize] {
        self.probs.shape()
    }
    pub fn ndim(&self) -> usize {
        self.probs.ndim()
    }

    pub fn axis_index(&self, name: &str) -> Result<usize> {
        self.axes
            .iter()
            .position(|a| a == name)
            .ok_or_else(|| DistributionError::UnknownAxis(name.to_owned()))
    }
    pub fn axis_len(&self, name: &str) -> Result<usize> {
        Ok(self.probs.len_of(Axis(self.axis_index(name)?)))
    }
    /// Positions of all the axes but `name`, increasing.
    pub fn other_axes(&self, name: &str) -> Result<Vec<usize>> {
        let idx = self.axis_index(name)?;
        Ok((0..self.ndim()).filter(|i| *i != idx).collect())
    }

    pub fn is_valid_conditional(&self, name: &str) -> Result<bool> {
        self.is_valid_conditional_with_tolerance(name, DEFAULT_TOLERANCE)
    }
    /// True if summing over `name` gives one for every assignment of the other axes.
    pub fn is_valid_conditional_with_tolerance(&self, name: &str, tol: Proba) -> Result<bool> {
        self.is_valid_conditional_on(&[name], tol)
    }
    /// Same as [`Distribution::is_valid_conditional`], jointly over several axes (`p(a,b|c)`).
    pub fn is_valid_conditional_on(&self, names: &[&str], tol: Proba) -> Result<bool> {
        let mut idx = names
            .iter()
            .map(|n| self.axis_index(n))
            .collect::<Result<Vec<_>>>()?;
        idx.sort_unstable();
        idx.dedup();
        let mut acc = self.probs.clone();
        for i in idx.into_iter().rev() {
            acc = acc.sum_axis(Axis(i));
        }
        Ok(acc.iter().all(|s| (s - 1.0).abs() <= tol))
    }
    pub fn is_valid_joint(&self) -> bool {
        self.is_valid_joint_with_tolerance(DEFAULT_TOLERANCE)
    }
    pub fn is_valid_joint_with_tolerance(&self, tol: Proba) -> bool {
        (self.probs.sum() - 1.0).abs() <= tol
    }

    /// Elementwise product with a rank-0 or single-axis table, broadcast over the other axes of
    /// `self`. The result keeps the axes of `self`.
    pub fn multiply(&self, other: &Distribution) -> Result<Self> {
        let mut res = self.clone();
        res.multiply_assign(other)?;
        Ok(res)
    }

    pub fn multiply_assign(&mut self, other: &Distribution) -> Result<()> {
        match other.axes.as_slice() {
            [] => {
                let c = other.probs.sum();
                self.probs.mapv_inplace(|x| x * c);
                Ok(())
            }
            [axis] => {
                let idx = self
                    .axis_index(axis)
                    .map_err(|_| DistributionError::AxisMismatch {
                        axis: axis.clone(),
                        reason: format!("not among axes [{}]", self.axes.join(", ")),
                    })?;
                let len = other.probs.len();
                if len != self.probs.len_of(Axis(idx)) {
                    return Err(DistributionError::AxisMismatch {
                        axis: axis.clone(),
                        reason: format!(
                            "got {} states, expected {}",
                            len,
                            self.probs.len_of(Axis(idx))
                        ),
                    });
                }
                let mut shape = vec![1; self.ndim()];
                shape[idx] = len;
                let other = other
                    .probs
                    .view()
                    .into_shape_with_order(IxDyn(&shape))
                    .map_err(|e| DistributionError::AxisMismatch {
                        axis: axis.clone(),
                        reason: e.to_string(),
                    })?;
                self.probs *= &other;
                Ok(())
            }
            _ => Err(DistributionError::AxisMismatch {
                axis: other.axes.join(","),
                reason: "only single-axis tables can be multiplied in".to_owned(),
            }),
        }
    }

    /// Sum over every axis but `name`.
    pub fn sum_to(&self, name: &str) -> Result<Array1<Proba>> {
        let others = self.other_axes(name)?;
        let mut acc = self.probs.clone();
        // Reduce from the last axis so that the remaining positions stay valid.
        for i in others.into_iter().rev() {
            acc = acc.sum_axis(Axis(i));
        }
        acc.into_dimensionality::<Ix1>()
            .map_err(|e| DistributionError::AxisMismatch {
                axis: name.to_owned(),
                reason: e.to_string(),
            })
    }

    /// Rescaled copy summing to one, `None` if the total mass is zero.
    pub fn normalized(&self) -> Option<Self> {
        let total = self.probs.sum();
        if total > 0.0 && total.is_finite() {
            Some(Self {
                probs: self.probs.mapv(|x| x / total),
                axes: self.axes.clone(),
            })
        } else {
            None
        }
    }
}

/// Payload carried along one directed edge of the factor graph.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Message {
    /// The scalar 1, sent by variables without other neighbors.
    Unit,
    Vector(Array1<Proba>),
}

impl Message {
    pub fn as_vector(&self) -> Option<&Array1<Proba>> {
        match self {
            Message::Unit => None,
            Message::Vector(v) => Some(v),
        }
    }
    /// Values over `nc` states, expanding [`Message::Unit`] to ones.
    pub fn to_array(&self, nc: usize) -> Array1<Proba> {
        match self {
            Message::Unit => Array1::ones(nc),
            Message::Vector(v) => v.clone(),
        }
    }
    pub fn is_unit(&self) -> bool {
        matches!(self, Message::Unit)
    }
    /// Vector message scaled to sum to one. Left as is if its mass is zero or not finite.
    pub fn normalized(v: Array1<Proba>) -> Self {
        let total = v.sum();
        if total > 0.0 && total.is_finite() {
            Message::Vector(v.mapv_into(|x| x / total))
        } else {
            Message::Vector(v)
        }
    }
    /// Elementwise product of messages, up to a positive factor. `None` if all of them are
    /// [`Message::Unit`].
    pub(crate) fn product<'a>(
        msgs: impl Iterator<Item = &'a Message>,
    ) -> Option<Array1<Proba>> {
        let mut acc: Option<Array1<Proba>> = None;
        for v in msgs.filter_map(Message::as_vector) {
            match acc.as_mut() {
                None => acc = Some(v.clone()),
                Some(a) => {
                    *a *= v;
                    // Rescale so that long products do not underflow.
                    let max = a.fold(0.0, |m: Proba, x| m.max(*x));
                    if max > 0.0 && max.is_finite() {
                        a.mapv_inplace(|x| x / max);
                    }
                }
            }
        }
        acc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array3};

    fn cond() -> Distribution {
        // p(v1|h1), rows v1, columns h1
        Distribution::new(array![[0.6, 0.1], [0.4, 0.9]].into_dyn(), ["v1", "h1"]).unwrap()
    }

    #[test]
    fn axis_lookup() {
        let d = Distribution::new(Array3::<f64>::zeros((2, 3, 4)).into_dyn(), ["a", "b", "c"])
            .unwrap();
        assert_eq!(d.axis_index("b").unwrap(), 1);
        assert_eq!(d.axis_len("c").unwrap(), 4);
        assert_eq!(d.other_axes("b").unwrap(), vec![0, 2]);
        assert_eq!(
            d.axis_index("z"),
            Err(DistributionError::UnknownAxis("z".to_owned()))
        );
    }

    #[test]
    fn construction_checks() {
        assert!(matches!(
            Distribution::new(array![0.5, 0.5].into_dyn(), ["a", "b"]),
            Err(DistributionError::Rank { rank: 1, labels: 2 })
        ));
        assert!(matches!(
            Distribution::new(array![[0.5], [0.5]].into_dyn(), ["a", "a"]),
            Err(DistributionError::DuplicateAxis(_))
        ));
        assert!(matches!(
            Distribution::new(array![0.5, -0.1].into_dyn(), ["a"]),
            Err(DistributionError::InvalidProbability(_))
        ));
        assert!(matches!(
            Distribution::new(array![0.5, f64::NAN].into_dyn(), ["a"]),
            Err(DistributionError::InvalidProbability(_))
        ));
    }

    #[test]
    fn validity() {
        let d = cond();
        assert!(d.is_valid_conditional("v1").unwrap());
        assert!(!d.is_valid_conditional("h1").unwrap());
        assert!(!d.is_valid_joint());
        let prior = Distribution::from_vector(array![0.2, 0.8], "h1").unwrap();
        assert!(prior.is_valid_joint());
        assert!(prior.is_valid_conditional("h1").unwrap());

        let pair = Distribution::new(
            array![[[0.1, 0.3], [0.2, 0.5]], [[0.3, 0.1], [0.4, 0.1]]].into_dyn(),
            ["a", "b", "c"],
        )
        .unwrap();
        assert!(pair.is_valid_conditional_on(&["a", "b"], DEFAULT_TOLERANCE).unwrap());
        assert!(!pair.is_valid_conditional("a").unwrap());
    }

    #[test]
    fn multiply_broadcasts_on_named_axis() {
        let d = cond();
        let prior = Distribution::from_vector(array![0.2, 0.8], "h1").unwrap();
        let joint = d.multiply(&prior).unwrap();
        assert_eq!(joint.axes(), d.axes());
        assert_eq!(joint.shape(), d.shape());
        let expected = array![[0.12, 0.08], [0.08, 0.72]].into_dyn();
        assert!(joint.probs().abs_diff_eq(&expected, 1e-12));
        assert!(joint.is_valid_joint());

        let scaled = d.multiply(&Distribution::scalar(2.0).unwrap()).unwrap();
        assert!(scaled.probs().abs_diff_eq(&(d.probs() * 2.0), 1e-12));
    }

    #[test]
    fn multiply_rejects_foreign_axis() {
        let d = cond();
        let other = Distribution::from_vector(array![0.5, 0.5], "h2").unwrap();
        assert!(matches!(
            d.multiply(&other),
            Err(DistributionError::AxisMismatch { .. })
        ));
        let wrong_len = Distribution::from_vector(array![0.2, 0.3, 0.5], "h1").unwrap();
        assert!(matches!(
            d.multiply(&wrong_len),
            Err(DistributionError::AxisMismatch { .. })
        ));
    }

    #[test]
    fn sum_to_axis() {
        let d = Distribution::new(
            Array3::from_shape_fn((2, 3, 2), |(i, j, k)| (i + 2 * j + 3 * k) as f64).into_dyn(),
            ["a", "b", "c"],
        )
        .unwrap();
        let b = d.sum_to("b").unwrap();
        // sum over i,k of i + 2j + 3k = 4 * 2j + 2 + 6
        assert_eq!(b, array![8.0, 16.0, 24.0]);
        assert_eq!(d.sum_to("a").unwrap().len(), 2);
    }

    #[test]
    fn message_product() {
        let msgs = [
            Message::Unit,
            Message::Vector(array![0.5, 2.0]),
            Message::Vector(array![4.0, 1.0]),
        ];
        // Rescaled by its largest entry.
        assert_eq!(Message::product(msgs.iter()), Some(array![1.0, 1.0]));
        assert_eq!(Message::product([Message::Unit].iter()), None);
        assert_eq!(Message::Unit.to_array(3), array![1.0, 1.0, 1.0]);
        assert!(Message::Unit.is_unit());
        assert!(!msgs[1].is_unit());
    }

    #[test]
    fn long_products_do_not_underflow() {
        let msgs = vec![Message::Vector(array![1e-3, 2e-3]); 500];
        let p = Message::product(msgs.iter()).unwrap();
        assert!(p[0] > 0.0);
        assert!((p[1] / p[0] - 2f64.powi(500)).abs() / 2f64.powi(500) < 1e-9);
    }

    #[test]
    fn normalization() {
        assert_eq!(
            Message::normalized(array![1.0, 3.0]),
            Message::Vector(array![0.25, 0.75])
        );
        assert_eq!(
            Message::normalized(array![0.0, 0.0]),
            Message::Vector(array![0.0, 0.0])
        );
        let d = cond().normalized().unwrap();
        assert_eq!(d.axes(), cond().axes());
        assert!(d.is_valid_joint());
        assert!(d.probs().abs_diff_eq(&(cond().probs() / 2.0), 1e-12));
        let empty = Distribution::from_vector(array![0.0, 0.0], "a").unwrap();
        assert_eq!(empty.normalized(), None);
    }
}
