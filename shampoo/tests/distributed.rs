use comms::local_mesh;
use ndarray::{Array2, ArrayD, IxDyn};
use rand::{Rng, SeedableRng, rngs::StdRng};
use shampoo::{
    DistributedShampoo, Phase, ShampooBuilder, ShampooErr, ShampooState, SingleWorker,
    grafting::{Grafting, GraftingConfig},
    linalg::{Exponent, RootMethod, RootSolver, relative_residual},
    preconditioning::BlockPreconditioner,
    specs::{
        GraftingSpec, LargeDimMethod, NewtonFallback, Precision, RootInverseSpec, ShampooSpec,
    },
};
use tokio::task::JoinSet;

fn gradients(shapes: &[Vec<usize>], step: u64) -> Vec<ArrayD<f32>> {
    let mut rng = StdRng::seed_from_u64(step);
    shapes
        .iter()
        .map(|shape| ArrayD::from_shape_fn(IxDyn(shape), |_| rng.random_range(-1f32..1f32)))
        .collect()
}

fn initial_params(shapes: &[Vec<usize>]) -> Vec<ArrayD<f32>> {
    let mut rng = StdRng::seed_from_u64(u64::MAX);
    shapes
        .iter()
        .map(|shape| ArrayD::from_shape_fn(IxDyn(shape), |_| rng.random_range(-1f32..1f32)))
        .collect()
}

fn mixed_spec() -> ShampooSpec {
    ShampooSpec {
        lr: 0.05,
        betas: (0.9, 0.999),
        momentum: 0.5,
        use_nesterov: true,
        weight_decay: 1e-3,
        precondition_frequency: 2,
        start_preconditioning_step: Some(2),
        grafting_type: GraftingSpec::Adam,
        grafting_beta2: 0.99,
        max_preconditioner_dim: 4,
        ..Default::default()
    }
}

fn mixed_shapes() -> Vec<Vec<usize>> {
    vec![vec![6, 5], vec![4], vec![]]
}

async fn run_single(
    spec: &ShampooSpec,
    shapes: &[Vec<usize>],
    steps: std::ops::Range<u64>,
    optimizer: Option<DistributedShampoo>,
    params: Option<Vec<ArrayD<f32>>>,
) -> (DistributedShampoo, Vec<ArrayD<f32>>) {
    let mut optimizer = optimizer
        .unwrap_or_else(|| ShampooBuilder::new(spec.clone()).build(shapes, 0, 1).unwrap());
    let mut params = params.unwrap_or_else(|| initial_params(shapes));

    for step in steps {
        let grads = gradients(shapes, step);
        optimizer
            .step(&mut params, &grads, &mut SingleWorker)
            .await
            .unwrap();
    }

    (optimizer, params)
}

#[tokio::test]
async fn warmup_matches_pure_grafting() {
    let spec = ShampooSpec {
        lr: 0.1,
        betas: (0., 1.),
        precondition_frequency: 100,
        start_preconditioning_step: Some(100),
        ..Default::default()
    };
    let shapes = vec![vec![3, 2]];

    let mut optimizer = ShampooBuilder::new(spec.clone()).build(&shapes, 0, 1).unwrap();
    let mut params = initial_params(&shapes);

    let cfg = GraftingConfig {
        epsilon: spec.grafting_epsilon,
        beta2: spec.grafting_beta2,
    };
    let mut grafting = Grafting::new(GraftingSpec::Adagrad, &[3, 2]);
    let mut reference = params[0].clone();

    for step in 0..100 {
        assert_eq!(optimizer.phase(), Phase::Warmup);

        let grads = gradients(&shapes, step);
        optimizer
            .step(&mut params, &grads, &mut SingleWorker)
            .await
            .unwrap();

        let g = grads[0].mapv(f64::from);
        grafting.update(&g, &cfg);
        let d = grafting.direction(&g, &cfg, step);
        reference.zip_mut_with(&d, |p, &d| *p = (f64::from(*p) * 1. - spec.lr * d) as f32);

        assert_eq!(params[0], reference, "diverged at step {step}");
    }

    // The 3x2 parameter is merged into a single axis of 6.
    let identity = Array2::<f64>::eye(6).into_dyn();
    assert_eq!(optimizer.inverse_roots(0, 0).unwrap()[0], identity);
    assert_eq!(optimizer.phase(), Phase::Active);

    let grads = gradients(&shapes, 100);
    optimizer
        .step(&mut params, &grads, &mut SingleWorker)
        .await
        .unwrap();

    let g = grads[0].mapv(f64::from);
    grafting.update(&g, &cfg);
    let d = grafting.direction(&g, &cfg, 100);
    reference.zip_mut_with(&d, |p, &d| *p = (f64::from(*p) - spec.lr * d) as f32);

    assert_ne!(optimizer.inverse_roots(0, 0).unwrap()[0], identity);
    assert_ne!(params[0], reference);
}

#[tokio::test]
async fn decoupled_and_l2_weight_decay_differ_predictably() {
    let base = ShampooSpec {
        lr: 0.1,
        betas: (0., 1.),
        weight_decay: 1e-5,
        precondition_frequency: 10,
        start_preconditioning_step: Some(10),
        ..Default::default()
    };
    let shapes = vec![vec![4]];
    let start = ArrayD::from_shape_vec(IxDyn(&[4]), vec![1f32, -2., 3., 0.5]).unwrap();
    let grad = ArrayD::from_shape_vec(IxDyn(&[4]), vec![0.5f32, 0.25, -1., 2.]).unwrap();

    let mut results = Vec::new();
    for decoupled in [true, false] {
        let spec = ShampooSpec {
            use_decoupled_weight_decay: decoupled,
            ..base.clone()
        };
        let mut optimizer = ShampooBuilder::new(spec).build(&shapes, 0, 1).unwrap();
        let mut params = vec![start.clone()];
        optimizer
            .step(&mut params, &[grad.clone()], &mut SingleWorker)
            .await
            .unwrap();
        results.push(params.remove(0));
    }

    let (lr, wd, eps) = (0.1f64, 1e-5f64, 1e-3f64);
    for i in 0..4 {
        let p = f64::from(start[[i]]);
        let g = f64::from(grad[[i]]);

        let decoupled = p * (1. - lr * wd) - lr * g / (g.abs() + eps);
        let l2_grad = g + wd * p;
        let l2 = p - lr * l2_grad / (l2_grad.abs() + eps);

        assert!((f64::from(results[0][[i]]) - decoupled).abs() < 1e-6);
        assert!((f64::from(results[1][[i]]) - l2).abs() < 1e-6);
    }

    assert_ne!(results[0], results[1]);
}

#[tokio::test]
async fn zero_gradient_leaves_parameter_and_state_untouched() {
    let spec = ShampooSpec {
        momentum: 0.9,
        ..Default::default()
    };
    let shapes = vec![vec![3, 3], vec![2, 2]];
    let (mut optimizer, mut params) = run_single(&spec, &shapes, 0..3, None, None).await;

    let frozen_param = params[1].clone();
    let frozen_state = optimizer.block(1, 0).unwrap().clone();

    let mut grads = gradients(&shapes, 3);
    grads[1] = ArrayD::zeros(IxDyn(&[2, 2]));
    optimizer
        .step(&mut params, &grads, &mut SingleWorker)
        .await
        .unwrap();

    assert_eq!(optimizer.step_count(), 4);
    assert_eq!(params[1], frozen_param);
    assert_eq!(optimizer.block(1, 0).unwrap(), &frozen_state);
}

#[tokio::test]
async fn workers_agree_with_a_single_worker() {
    const WORLD: usize = 3;
    const STEPS: u64 = 7;

    let spec = mixed_spec();
    let shapes = mixed_shapes();
    let (single, expected) = run_single(&spec, &shapes, 0..STEPS, None, None).await;
    assert!(single.block_count() > WORLD);

    let meshes = local_mesh(WORLD, 1024).unwrap();
    let mut join_set = JoinSet::new();

    for mut mesh in meshes {
        let spec = spec.clone();
        let shapes = shapes.clone();

        join_set.spawn(async move {
            let rank = mesh.rank();
            let mut optimizer = ShampooBuilder::new(spec).build(&shapes, rank, WORLD)?;
            let mut params = initial_params(&shapes);

            for step in 0..STEPS {
                let grads = gradients(&shapes, step);
                optimizer.step(&mut params, &grads, &mut mesh).await?;
            }

            mesh.disconnect().await?;
            Ok::<_, ShampooErr>((rank, params, optimizer.assignment().owned_by(rank).count()))
        });
    }

    let mut owned = 0;
    while let Some(result) = join_set.join_next().await {
        let (rank, params, count) = result.unwrap().unwrap();
        assert_eq!(params, expected, "rank {rank} diverged");
        owned += count;
    }

    assert_eq!(owned, single.assignment().owned_by(0).count());
}

#[tokio::test]
async fn checkpoint_round_trip_is_exact() {
    let spec = mixed_spec();
    let shapes = mixed_shapes();

    let (optimizer, params) = run_single(&spec, &shapes, 0..4, None, None).await;
    let json = optimizer.state_dict().to_json().unwrap();

    let (_, uninterrupted) =
        run_single(&spec, &shapes, 4..9, Some(optimizer), Some(params.clone())).await;

    let mut restored = ShampooBuilder::new(spec.clone()).build(&shapes, 0, 1).unwrap();
    restored
        .load_state_dict(ShampooState::from_json(&json).unwrap())
        .unwrap();
    assert_eq!(restored.step_count(), 4);

    let (_, resumed) = run_single(&spec, &shapes, 4..9, Some(restored), Some(params)).await;
    assert_eq!(resumed, uninterrupted);
}

#[tokio::test]
async fn checkpoint_rejects_other_shapes() {
    let spec = ShampooSpec::default();
    let (optimizer, _) = run_single(&spec, &[vec![4, 4]], 0..1, None, None).await;
    let state = optimizer.state_dict();

    let mut other = ShampooBuilder::new(spec).build(&[vec![4usize, 5]], 0, 1).unwrap();
    assert!(matches!(
        other.load_state_dict(state),
        Err(ShampooErr::ShapeMismatch { .. })
    ));
    assert_eq!(other.step_count(), 0);
}

#[tokio::test]
async fn checkpoint_rejects_other_grafting() {
    let adam = ShampooSpec {
        grafting_type: GraftingSpec::Adam,
        grafting_beta2: 0.99,
        ..Default::default()
    };
    let (optimizer, _) = run_single(&adam, &[vec![4, 4]], 0..2, None, None).await;
    let state = optimizer.state_dict();

    let mut other = ShampooBuilder::new(ShampooSpec::default())
        .build(&[vec![4usize, 4]], 0, 1)
        .unwrap();
    assert!(matches!(
        other.load_state_dict(state),
        Err(ShampooErr::InvalidConfig {
            field: "grafting_type",
            ..
        })
    ));

    assert_eq!(other.step_count(), 0);
    assert_eq!(other.block(0, 0).unwrap().grafting().spec(), GraftingSpec::Adagrad);
}

#[tokio::test]
async fn checkpoint_rejects_other_momentum() {
    let spec = ShampooSpec {
        momentum: 0.5,
        ..Default::default()
    };
    let (optimizer, _) = run_single(&spec, &[vec![3]], 0..1, None, None).await;
    let state = optimizer.state_dict();

    let mut other = ShampooBuilder::new(ShampooSpec::default())
        .build(&[vec![3usize]], 0, 1)
        .unwrap();
    assert!(matches!(
        other.load_state_dict(state),
        Err(ShampooErr::InvalidConfig {
            field: "momentum",
            ..
        })
    ));
}

#[tokio::test]
async fn diagonal_factors_for_large_dims() {
    let spec = ShampooSpec {
        large_dim_method: LargeDimMethod::Diagonal,
        max_preconditioner_dim: 4,
        ..Default::default()
    };
    let shapes = vec![vec![6, 3]];
    let (optimizer, params) = run_single(&spec, &shapes, 0..4, None, None).await;

    let block = optimizer.block(0, 0).unwrap();
    assert_eq!(block.preconditioner().kind(), "shampoo [diagonal, full]");
    assert_eq!(optimizer.block_count(), 1);

    let roots = optimizer.inverse_roots(0, 0).unwrap();
    assert_eq!(roots[0].shape(), &[6]);
    assert_eq!(roots[1].shape(), &[3, 3]);
    assert!(roots[0].iter().all(|&r| r.is_finite() && r != 1.));

    assert!(params[0].iter().all(|p| p.is_finite()));
    assert_ne!(params[0], initial_params(&shapes)[0]);
}

#[tokio::test]
async fn bf16_statistics_stay_representable() {
    let spec = ShampooSpec {
        statistics_precision: Precision::Bf16,
        ..Default::default()
    };
    let shapes = vec![vec![5, 3]];
    let (optimizer, params) = run_single(&spec, &shapes, 0..3, None, None).await;

    let BlockPreconditioner::Shampoo(p) = optimizer.block(0, 0).unwrap().preconditioner() else {
        panic!("expected a shampoo block");
    };

    for factor in p.factors() {
        let statistics = factor.statistics();
        assert!(statistics.iter().any(|&s| s != 0.));
        assert!(statistics.iter().all(|&s| Precision::Bf16.round(s) == s));
    }

    assert!(params[0].iter().all(|p| p.is_finite()));
}

#[tokio::test]
async fn newton_and_eigen_roots_agree() {
    let shapes = vec![vec![4, 3]];
    let eigen = ShampooSpec {
        epsilon: 1e-3,
        statistics_precision: Precision::F64,
        ..Default::default()
    };
    let newton = ShampooSpec {
        root_inverse_method: RootInverseSpec::Newton,
        ..eigen.clone()
    };

    let (_, a) = run_single(&eigen, &shapes, 0..5, None, None).await;
    let (_, b) = run_single(&newton, &shapes, 0..5, None, None).await;

    let diff = (&a[0] - &b[0]).mapv(f32::abs);
    assert!(diff.iter().all(|&d| d < 1e-3), "{diff:?}");
}

#[test]
fn inverse_roots_of_random_psd_matrices() {
    let mut rng = StdRng::seed_from_u64(7);
    let exponent = Exponent::for_order(2, 0, 1.);

    let methods = [
        (RootMethod::Eigen, 1e-8),
        (
            RootMethod::Newton {
                max_iterations: 1000,
                tolerance: 1e-10,
                fallback: NewtonFallback::ReusePrevious,
            },
            1e-6,
        ),
    ];

    for _ in 0..5 {
        let b = Array2::from_shape_fn((5, 5), |_| rng.random_range(-1.0..1.0));
        let a = b.dot(&b.t()) + Array2::<f64>::eye(5);

        for (method, tolerance) in methods {
            let solver = RootSolver::new(method, 1e-12, Precision::F64).unwrap();
            let root = solver.compute_inverse_root(&a, exponent).unwrap();
            let residual = relative_residual(&a, &root, exponent).unwrap();

            assert!(residual < tolerance, "{method:?}: {residual:e}");
        }
    }
}

#[tokio::test]
async fn step_rejects_mismatched_inputs() {
    let shapes = vec![vec![2, 2]];
    let mut optimizer = ShampooBuilder::default().build(&shapes, 0, 1).unwrap();
    let mut params = initial_params(&shapes);

    let result = optimizer.step(&mut params, &[], &mut SingleWorker).await;
    assert!(matches!(
        result,
        Err(ShampooErr::ParamCountMismatch { what: "gradients", .. })
    ));

    let grads = vec![ArrayD::zeros(IxDyn(&[2, 3]))];
    let result = optimizer.step(&mut params, &grads, &mut SingleWorker).await;
    assert!(matches!(result, Err(ShampooErr::ShapeMismatch { .. })));

    let mut meshes = local_mesh(2, 64).unwrap();
    let grads = gradients(&shapes, 0);
    let result = optimizer.step(&mut params, &grads, &mut meshes[0]).await;
    assert!(matches!(result, Err(ShampooErr::WorldSizeMismatch { got: 2, expected: 1 })));

    assert_eq!(optimizer.step_count(), 0);
}

#[tokio::test]
async fn broken_peer_fails_the_step() {
    let shapes = vec![vec![3, 3]];
    let mut meshes = local_mesh(2, 64).unwrap();
    drop(meshes.pop());
    let mut mesh = meshes.pop().unwrap();

    let mut optimizer = ShampooBuilder::default().build(&shapes, 0, 2).unwrap();
    assert_eq!(optimizer.assignment().owner(0), Some(0));

    let mut params = initial_params(&shapes);
    let grads = gradients(&shapes, 0);
    let result = optimizer.step(&mut params, &grads, &mut mesh).await;

    assert!(matches!(result, Err(ShampooErr::Io(_))));
    assert_eq!(optimizer.step_count(), 0);
}
