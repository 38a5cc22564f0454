//! Work-cell calibration tool
//!
//! Calibrates a camera chain against a target chain from pose measurements or
//! 2D-3D/3D-3D correspondences, once with DH offsets and once with the target
//! chain's offsets masked, and reports how much the offsets improve the fit.
//!
//! Usage:
//! ```bash
//! cargo run --release -- --config samples/two_axis_positioner.yaml
//! cargo run --release -- --synthetic
//! ```

use clap::Parser;
use kinematic_calibration_tools::geometry::isometry_from_pose6;
use kinematic_calibration_tools::kinematics::DhChain;
use kinematic_calibration_tools::optimization::{
    optimize, CalibrationData, CalibrationProblem, DhMask, SolverOptions, TransformMask,
};
use kinematic_calibration_tools::synthetic::{joint_grid, linspace, two_axis_positioner, Scene};
use kinematic_calibration_tools::util::{self, CalibrationReport, RunReport};
use kinematic_calibration_tools::validation::{
    compare_to_measurements, compute_kinematic_reprojection_error,
};
use log::{error, info};
use nalgebra::Isometry3;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

/// Kinematic work-cell calibration tool
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the calibration configuration file
    #[arg(short = 'c', long, required_unless_present = "synthetic")]
    config: Option<PathBuf>,

    /// Directory for the JSON report
    #[arg(short = 'o', long, default_value = "output")]
    output: PathBuf,

    /// Calibrate a simulated two-axis positioner instead of loading a configuration
    #[arg(long)]
    synthetic: bool,
}

struct Session {
    problem: CalibrationProblem,
    offset_prior_weight: f64,
    solver: SolverOptions,
    correlation_threshold: f64,
}

fn load_session(config_path: &Path) -> Result<Session, Box<dyn std::error::Error>> {
    let config = util::load_config(config_path)?;
    let data = config.load_data()?;
    Ok(Session {
        problem: config.build_problem(data)?,
        offset_prior_weight: config.offset_prior_weight,
        solver: config.solver.clone(),
        correlation_threshold: config.correlation_threshold,
    })
}

/// Fixed camera, target on a two-axis positioner with small DH errors.
fn synthetic_session() -> Result<Session, Box<dyn std::error::Error>> {
    let mut scene = Scene::new(
        DhChain::fixed(Isometry3::identity()),
        two_axis_positioner(),
        isometry_from_pose6(&[0.1, -0.2, 0.3, 0.1, 0.2, -0.3]),
        isometry_from_pose6(&[0.05, 0.1, 0.02, 0.3, -0.1, 0.2]),
        Isometry3::identity(),
    );
    scene.target_chain_offsets[(0, 2)] = 0.004;
    scene.target_chain_offsets[(0, 3)] = 0.002;

    let states: Vec<_> = joint_grid(&[linspace(-1.5, 1.5, 7), linspace(-2.5, 2.5, 7)])
        .into_iter()
        .map(|target| (Vec::new(), target))
        .collect();
    let measurements = scene.pose_measurements(&states)?;
    info!("Simulated {} measurements", measurements.len());

    let mut problem = CalibrationProblem::new(
        scene.camera_chain.clone(),
        scene.target_chain.clone(),
        CalibrationData::Poses(measurements),
    );
    problem.camera_mount_to_camera_guess =
        isometry_from_pose6(&[0.12, -0.18, 0.27, 0.12, 0.17, -0.28]);
    problem.target_mount_to_target_guess =
        isometry_from_pose6(&[0.03, 0.12, 0.0, 0.28, -0.08, 0.22]);
    problem.target_chain_offset_stdev = 0.005;
    problem.mask.camera_base_to_target_base = TransformMask::ALL;
    problem.mask.target_chain.fix_row(1)?;

    Ok(Session {
        problem,
        offset_prior_weight: 100.0,
        solver: SolverOptions::default(),
        correlation_threshold: 0.5,
    })
}

fn calibrate_and_validate(
    label: &str,
    session: &Session,
    problem: &CalibrationProblem,
) -> Result<RunReport, Box<dyn std::error::Error>> {
    info!("Running calibration: {label}");
    let result = optimize(problem, session.offset_prior_weight, &session.solver)?;
    util::display_calibration_result(label, &result, session.correlation_threshold);

    let (camera_chain, target_chain) = (&problem.camera_chain, &problem.target_chain);
    let (stats, reprojection) = match &problem.data {
        CalibrationData::Poses(measurements) => {
            let stats = compare_to_measurements(camera_chain, target_chain, &result, measurements)?;
            util::display_stats(label, &stats);
            (Some(stats), None)
        }
        CalibrationData::Image {
            camera,
            observations,
        } => {
            let error = compute_kinematic_reprojection_error(
                camera_chain,
                target_chain,
                &result,
                observations,
                camera,
            )?;
            util::display_reprojection_error(label, &error);
            (None, Some(error))
        }
        CalibrationData::Points(observations) => {
            let error = compute_kinematic_reprojection_error(
                camera_chain,
                target_chain,
                &result,
                observations,
                &(),
            )?;
            util::display_reprojection_error(label, &error);
            (None, Some(error))
        }
    };
    Ok(RunReport {
        label: label.to_string(),
        result,
        stats,
        reprojection,
    })
}

fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let session = match (&cli.config, cli.synthetic) {
        (_, true) => synthetic_session()?,
        (Some(path), false) => load_session(path)?,
        (None, false) => return Err("either --config or --synthetic is required".into()),
    };

    let with_offsets =
        calibrate_and_validate("Calibration with DH offsets", &session, &session.problem)?;

    let mut without_problem = session.problem.clone();
    without_problem.mask.target_chain = DhMask::all_fixed(without_problem.target_chain.dof());
    let without_offsets = calibrate_and_validate(
        "Calibration without target chain offsets",
        &session,
        &without_problem,
    )?;

    let improvement = match (&without_offsets.stats, &with_offsets.stats) {
        (Some(without), Some(with)) => Some(without.percent_diff(with)),
        _ => None,
    };
    if let Some(improvement) = &improvement {
        util::display_improvement(improvement);
    }

    let report = CalibrationReport {
        runs: vec![
            RunReport {
                label: "with_offsets".to_string(),
                ..with_offsets
            },
            RunReport {
                label: "without_target_offsets".to_string(),
                ..without_offsets
            },
        ],
        improvement,
    };
    let path = util::export_calibration_report(&report, &cli.output)?;
    println!("\n💾 Report saved to {}", path.display());
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
