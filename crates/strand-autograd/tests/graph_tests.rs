// Integration tests for the graph: saved variables, engine scheduling and
// grad mode

use std::sync::{Arc, Mutex};

use strand_autograd::function::add;
use strand_autograd::{
    backward, conv, no_grad, BackendContext, BackwardOptions, ConvParams, Error, Function,
    FunctionFlags, Result, SavedVariable, Variable,
};
use strand_core::{ops, Tensor};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn scalar_leaf(v: f64) -> Variable<f64> {
    Variable::leaf(Tensor::from_vec(vec![v], 1).unwrap(), true)
}

fn conv_graph() -> (Variable<f64>, Variable<f64>, Variable<f64>) {
    let x = Variable::leaf(Tensor::randn((1, 2, 4, 4), 1).unwrap(), true);
    let w = Variable::leaf(Tensor::randn((3, 2, 3, 3), 2).unwrap(), true);
    let params = ConvParams::from_context(&BackendContext::portable(), 2);
    let y = conv(&x, &w, None, &params).unwrap();
    (x, w, y)
}

// A node that saves its own output: d/dx exp(x) = exp(x).

struct ExpBackward {
    flags: FunctionFlags<f64>,
    result: Mutex<Option<SavedVariable<f64>>>,
}

impl Function<f64> for ExpBackward {
    fn name(&self) -> &'static str {
        "ExpBackward"
    }

    fn flags(&self) -> &FunctionFlags<f64> {
        &self.flags
    }

    fn apply(&self, grads: &[Option<Variable<f64>>]) -> Result<Vec<Option<Variable<f64>>>> {
        let Some(gy) = grads.first().cloned().flatten() else {
            return Ok(vec![None]);
        };
        let guard = self.result.lock().unwrap();
        let result = guard.as_ref().ok_or_else(|| Error::msg("result not saved"))?.unpack()?;
        let gx = ops::mul(gy.data(), result.data())?;
        Ok(vec![Some(Variable::constant(gx))])
    }

    fn release_variables(&self) {
        if let Some(saved) = self.result.lock().unwrap().as_mut() {
            saved.release();
        }
    }
}

fn exp(x: &Variable<f64>) -> (Variable<f64>, Arc<ExpBackward>) {
    let data: Vec<f64> = x.to_vec().unwrap().iter().map(|v| v.exp()).collect();
    let out = Tensor::from_vec(data, x.shape().clone()).unwrap();
    let node = Arc::new(ExpBackward {
        flags: FunctionFlags::from_inputs(&[Some(x)]),
        result: Mutex::new(None),
    });
    let y = Variable::from_function(out, node.clone() as Arc<dyn Function<f64>>, 0);
    *node.result.lock().unwrap() = Some(SavedVariable::new(&y, "ExpBackward", "result", true));
    (y, node)
}

// SAVED VARIABLES

#[test]
fn test_inplace_modification_detected() {
    init_logging();
    let (x, _w, y) = conv_graph();
    ops::fill_(x.data(), 1.0).unwrap();
    let seed = Tensor::ones(y.shape().clone()).unwrap();
    match y.backward(&seed, BackwardOptions::default()) {
        Err(Error::SavedVariableModified { name, saved, current }) => {
            assert_eq!(name, "input of ConvBackward");
            assert_eq!(current, saved + 1);
        }
        other => panic!("expected SavedVariableModified, got {other:?}"),
    }
}

#[test]
fn test_second_backward_needs_retain_graph() -> Result<()> {
    let (x, w, y) = conv_graph();
    let seed = Tensor::ones(y.shape().clone())?;
    y.backward(&seed, BackwardOptions::default())?;
    match y.backward(&seed, BackwardOptions::default()) {
        Err(Error::SavedVariableReleased { node }) => assert_eq!(node, "ConvBackward"),
        other => panic!("expected SavedVariableReleased, got {other:?}"),
    }

    let params = ConvParams::from_context(&BackendContext::portable(), 2);
    let y = conv(&x, &w, None, &params)?;
    let first = y.backward(&seed, BackwardOptions::default().with_retain_graph(true))?;
    let second = y.backward(&seed, BackwardOptions::default())?;
    for v in [&x, &w] {
        assert_eq!(first.tensor(v).unwrap().to_vec()?, second.tensor(v).unwrap().to_vec()?);
    }
    Ok(())
}

#[test]
fn test_saved_output_does_not_own_its_node() -> Result<()> {
    let x = Variable::leaf(Tensor::from_vec(vec![0.0, 1.0, -2.0], 3)?, true);
    let (y, node) = exp(&x);
    assert!(node.result.lock().unwrap().as_ref().unwrap().is_owner_output());

    let grads = y.backward(&Tensor::ones(3)?, BackwardOptions::default())?;
    let expected: Vec<f64> = [0.0f64, 1.0, -2.0].iter().map(|v| v.exp()).collect();
    assert_eq!(grads.tensor(&x).unwrap().to_vec()?, expected);
    assert!(node.result.lock().unwrap().as_ref().unwrap().is_released());

    let weak = Arc::downgrade(&node);
    drop(y);
    drop(node);
    assert!(weak.upgrade().is_none());
    Ok(())
}

#[test]
fn test_saved_output_after_owner_dropped() {
    let x = scalar_leaf(1.0);
    let (y, node) = exp(&x);
    let saved = node.result.lock().unwrap().take().unwrap();
    drop(y);
    drop(node);
    assert!(matches!(saved.unpack(), Err(Error::SavedVariableReleased { .. })));
}

// ENGINE

#[test]
fn test_diamond_runs_in_reverse_creation_order() -> Result<()> {
    init_logging();
    let x = scalar_leaf(3.0);
    let a = add(&x, &x)?;
    let b = add(&a, &x)?;
    let c = add(&a, &b)?;
    let grads = c.backward(&Tensor::ones(1)?, BackwardOptions::default())?;
    // c = 5x
    assert_eq!(grads.tensor(&x).unwrap().to_vec()?, vec![5.0]);
    assert!(grads.get(&a).is_none());

    let order = grads.execution_order();
    assert_eq!(order.len(), 3);
    assert!(order.windows(2).all(|w| w[0] > w[1]));
    let ids: Vec<_> = [&c, &b, &a].iter().map(|v| v.grad_fn().unwrap().flags().id).collect();
    assert_eq!(order, &ids[..]);
    Ok(())
}

#[test]
fn test_multiple_roots() -> Result<()> {
    let x = scalar_leaf(1.0);
    let w = scalar_leaf(2.0);
    let y1 = add(&x, &x)?;
    let y2 = add(&x, &w)?;
    let seeds = [
        Variable::constant(Tensor::ones(1)?),
        Variable::constant(Tensor::full(1, 2.0)?),
    ];
    let grads = backward(&[y1, y2], &seeds, BackwardOptions::default())?;
    assert_eq!(grads.tensor(&x).unwrap().to_vec()?, vec![4.0]);
    assert_eq!(grads.tensor(&w).unwrap().to_vec()?, vec![2.0]);
    assert_eq!(grads.len(), 2);
    Ok(())
}

#[test]
fn test_root_and_seed_counts_must_agree() {
    let x = scalar_leaf(1.0);
    let y = add(&x, &x).unwrap();
    let err = backward(&[y], &[], BackwardOptions::default()).unwrap_err();
    assert!(matches!(err, Error::Msg(_)));
}

#[test]
fn test_only_required_gradients() -> Result<()> {
    let x = Variable::leaf(Tensor::<f64>::randn((1, 1, 3, 3), 5)?, true);
    let w = Variable::leaf(Tensor::<f64>::randn((1, 1, 2, 2), 6)?, false);
    let params = ConvParams::from_context(&BackendContext::portable(), 2);
    let y = conv(&x, &w, None, &params)?;
    let grads = y.backward(&Tensor::ones((1, 1, 2, 2))?, BackwardOptions::default())?;
    assert!(grads.get(&x).is_some());
    assert!(grads.get(&w).is_none());
    Ok(())
}

#[test]
fn test_create_graph_makes_gradients_differentiable() -> Result<()> {
    let x = scalar_leaf(2.0);
    let r = scalar_leaf(1.0);
    let y = add(&x, &x)?;
    let first = backward(&[y], &[r.clone()], BackwardOptions::default().with_create_graph(true))?;
    let gx = first.get(&x).unwrap().clone();
    assert_eq!(gx.to_vec()?, vec![2.0]);
    assert_eq!(gx.grad_fn().map(|f| f.name()), Some("AddBackward"));

    let second = gx.backward(&Tensor::ones(1)?, BackwardOptions::default())?;
    assert_eq!(second.tensor(&r).unwrap().to_vec()?, vec![2.0]);
    Ok(())
}

#[test]
fn test_without_create_graph_gradients_are_constants() -> Result<()> {
    let x = scalar_leaf(2.0);
    let r = scalar_leaf(1.0);
    let y = add(&x, &x)?;
    let grads = backward(&[y], &[r], BackwardOptions::default())?;
    let gx = grads.get(&x).unwrap();
    assert!(gx.is_leaf());
    assert!(!gx.requires_grad());
    Ok(())
}

// GRAD MODE

#[test]
fn test_no_grad_records_nothing() -> Result<()> {
    let (x, w, _) = conv_graph();
    let params = ConvParams::from_context(&BackendContext::portable(), 2);
    let (y, s) = no_grad(|| -> Result<_> { Ok((conv(&x, &w, None, &params)?, add(&x, &x)?)) })?;
    for v in [&y, &s] {
        assert!(v.is_leaf());
        assert!(!v.requires_grad());
    }
    assert!(y.backward(&Tensor::ones(y.shape().clone())?, BackwardOptions::default()).is_err());
    Ok(())
}

#[test]
fn test_detach_shares_data() -> Result<()> {
    let (_, _, y) = conv_graph();
    let d = y.detach();
    assert!(d.is_leaf());
    assert!(!d.requires_grad());
    assert_eq!(d.to_vec()?, y.to_vec()?);
    assert_ne!(d.id(), y.id());
    Ok(())
}
