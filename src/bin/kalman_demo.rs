//! Diagnostic: shows the 1-D Kalman gain converging toward the steady-state
//! value q/(q+r) as a constant step measurement is fed in repeatedly.

use rep_tracker_rs::pipeline::default_velocity_kalman;

fn main() {
    println!("=== 1-D Kalman Gain Convergence Demo ===\n");

    let mut kalman = default_velocity_kalman();
    let measurement = 1.0;
    let steps = 200;

    println!("step  estimate      gain");
    for step in 0..steps {
        let estimate = kalman.update(measurement);
        if step % 20 == 0 || step == steps - 1 {
            println!("{step:>4}  {estimate:>10.6}  {:>8.6}", kalman.state().k);
        }
    }

    let state = kalman.state();
    let steady_state_gain = state.q / (state.q + state.r);
    println!(
        "\nfinal gain {:.6}, theoretical q/(q+r) {:.6}",
        state.k, steady_state_gain
    );
}
