// Auto-driver: a ring of forced, damped Duffing oscillators that keep
// the fluid moving when no pointer is active. Each oscillator feeds
// one splat per frame.

use std::f32::consts::TAU;

// Oscillators live in a unit-ish phase space; outputs are re-centered
// into texture coordinates around the home ring.
const HOME_CENTER: [f32; 2] = [0.5, 0.5];
const HOME_RING_RADIUS: f32 = 0.3;
const CONTAINMENT_RADIUS: f32 = 1.5;
const CONTAINMENT_STIFFNESS: f32 = 4.0;
const OUTPUT_SCALE: f32 = 0.12;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OscillatorParams {
    pub count: u32,
    pub damping: f32,
    pub stiffness: f32,
    pub cubic_stiffness: f32,
    pub forcing_amplitude: f32,
    pub forcing_frequency: f32,
}

// A point and per-frame texcoord delta, to be colored and turned into
// a splat by the caller.
#[derive(Debug, Clone, Copy)]
pub struct SplatSeed {
    pub position: [f32; 2],
    pub delta: [f32; 2],
}

#[derive(Debug, Clone)]
struct Oscillator {
    home: [f32; 2],
    phase_offset: f32,
    displacement: [f32; 2],
    velocity: [f32; 2],
}

// Sinusoidal drive, rotated by the oscillator's phase offset. At t=0
// this depends only on the phase offset.
fn forcing(params: &OscillatorParams, phase_offset: f32, time: f32) -> [f32; 2] {
    let angle = TAU * params.forcing_frequency * time + phase_offset;
    [
        params.forcing_amplitude * angle.cos(),
        params.forcing_amplitude * angle.sin(),
    ]
}

pub struct OscillatorField {
    params: OscillatorParams,
    oscillators: Vec<Oscillator>,
    time: f32,
}

impl OscillatorField {
    pub fn new(params: OscillatorParams) -> Self {
        let mut field = Self {
            params,
            oscillators: Vec::new(),
            time: 0.0,
        };
        field.rebuild();
        field
    }

    fn rebuild(&mut self) {
        let count = self.params.count as usize;
        self.oscillators = (0..count)
            .map(|index| {
                let phase_offset = TAU * index as f32 / count.max(1) as f32;
                Oscillator {
                    home: [
                        HOME_CENTER[0] + HOME_RING_RADIUS * phase_offset.cos(),
                        HOME_CENTER[1] + HOME_RING_RADIUS * phase_offset.sin(),
                    ],
                    phase_offset,
                    displacement: [0.0, 0.0],
                    velocity: [0.0, 0.0],
                }
            })
            .collect();
    }

    // Count changes rebuild the ring (fresh state); other parameter
    // changes keep the current trajectories.
    pub fn set_params(&mut self, params: OscillatorParams) {
        let count_changed = params.count != self.params.count;
        self.params = params;
        if count_changed {
            self.rebuild();
        }
    }

    pub fn params(&self) -> &OscillatorParams {
        &self.params
    }

    // Advance every oscillator by dt and emit one splat seed each.
    pub fn step(&mut self, dt: f32) -> Vec<SplatSeed> {
        let mut seeds = Vec::with_capacity(self.oscillators.len());
        for osc in &mut self.oscillators {
            let drive = forcing(&self.params, osc.phase_offset, self.time);
            for axis in 0..2 {
                let x = osc.displacement[axis];
                let accel = -self.params.damping * osc.velocity[axis]
                    - self.params.stiffness * x
                    - self.params.cubic_stiffness * x * x * x
                    + drive[axis];
                osc.velocity[axis] += accel * dt;
            }

            // Soft spring back toward home once past the containment
            // radius; the cubic term alone can diverge without it.
            let dist =
                (osc.displacement[0] * osc.displacement[0] + osc.displacement[1] * osc.displacement[1]).sqrt();
            if dist > CONTAINMENT_RADIUS {
                let overshoot = dist - CONTAINMENT_RADIUS;
                for axis in 0..2 {
                    osc.velocity[axis] -=
                        overshoot * (osc.displacement[axis] / dist) * CONTAINMENT_STIFFNESS * dt;
                }
            }

            osc.displacement[0] += osc.velocity[0] * dt;
            osc.displacement[1] += osc.velocity[1] * dt;

            seeds.push(SplatSeed {
                position: [
                    (osc.home[0] + OUTPUT_SCALE * osc.displacement[0]).clamp(0.0, 1.0),
                    (osc.home[1] + OUTPUT_SCALE * osc.displacement[1]).clamp(0.0, 1.0),
                ],
                delta: [
                    osc.velocity[0] * OUTPUT_SCALE * dt,
                    osc.velocity[1] * OUTPUT_SCALE * dt,
                ],
            });
        }
        self.time += dt;
        seeds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_params(count: u32) -> OscillatorParams {
        OscillatorParams {
            count,
            damping: 0.35,
            stiffness: 1.1,
            cubic_stiffness: 0.9,
            forcing_amplitude: 1.4,
            forcing_frequency: 0.45,
        }
    }

    #[test]
    fn test_homes_lie_on_ring_with_even_phases() {
        let field = OscillatorField::new(test_params(4));
        for (index, osc) in field.oscillators.iter().enumerate() {
            let expected_phase = TAU * index as f32 / 4.0;
            assert!(
                (osc.phase_offset - expected_phase).abs() < 1e-6,
                "oscillator {} phase {} != {}",
                index,
                osc.phase_offset,
                expected_phase
            );
            let dx = osc.home[0] - HOME_CENTER[0];
            let dy = osc.home[1] - HOME_CENTER[1];
            let radius = (dx * dx + dy * dy).sqrt();
            assert!(
                (radius - HOME_RING_RADIUS).abs() < 1e-6,
                "oscillator {} off the home ring: r={}",
                index,
                radius
            );
        }
    }

    #[test]
    fn test_forcing_at_t0_depends_only_on_phase() {
        let params = test_params(8);
        let a = forcing(&params, 0.0, 0.0);
        let b = forcing(&params, TAU / 8.0, 0.0);
        assert!((a[0] - params.forcing_amplitude).abs() < 1e-6);
        assert!(a[1].abs() < 1e-6);
        // Same magnitude, rotated by the phase offset.
        let mag_a = (a[0] * a[0] + a[1] * a[1]).sqrt();
        let mag_b = (b[0] * b[0] + b[1] * b[1]).sqrt();
        assert!((mag_a - mag_b).abs() < 1e-5);
        let expected = [
            params.forcing_amplitude * (TAU / 8.0).cos(),
            params.forcing_amplitude * (TAU / 8.0).sin(),
        ];
        assert!((b[0] - expected[0]).abs() < 1e-6 && (b[1] - expected[1]).abs() < 1e-6);
    }

    #[test]
    fn test_unforced_oscillator_stays_home() {
        let mut params = test_params(2);
        params.forcing_amplitude = 0.0;
        let mut field = OscillatorField::new(params);
        for _ in 0..100 {
            field.step(1.0 / 60.0);
        }
        for osc in &field.oscillators {
            assert!(
                osc.displacement[0].abs() < 1e-6 && osc.displacement[1].abs() < 1e-6,
                "unforced oscillator drifted to {:?}",
                osc.displacement
            );
        }
    }

    #[test]
    fn test_damping_reduces_free_velocity() {
        let mut params = test_params(1);
        params.forcing_amplitude = 0.0;
        params.stiffness = 0.0;
        params.cubic_stiffness = 0.0;
        let mut field = OscillatorField::new(params);
        field.oscillators[0].velocity = [1.0, 0.0];
        field.step(1.0 / 60.0);
        let v = field.oscillators[0].velocity;
        assert!(v[0] < 1.0 && v[0] > 0.0, "damping should shrink velocity, got {}", v[0]);
    }

    #[test]
    fn test_containment_pulls_back_runaway() {
        let mut params = test_params(1);
        params.forcing_amplitude = 0.0;
        params.stiffness = 0.0;
        params.cubic_stiffness = 0.0;
        params.damping = 0.0;
        let mut field = OscillatorField::new(params);
        field.oscillators[0].displacement = [CONTAINMENT_RADIUS * 2.0, 0.0];
        field.step(1.0 / 60.0);
        assert!(
            field.oscillators[0].velocity[0] < 0.0,
            "containment should push toward home, velocity {:?}",
            field.oscillators[0].velocity
        );
    }

    #[test]
    fn test_step_emits_one_seed_per_oscillator_in_bounds() {
        let mut field = OscillatorField::new(test_params(5));
        for _ in 0..200 {
            let seeds = field.step(1.0 / 60.0);
            assert_eq!(seeds.len(), 5);
            for seed in seeds {
                assert!(
                    (0.0..=1.0).contains(&seed.position[0])
                        && (0.0..=1.0).contains(&seed.position[1]),
                    "seed left texture space: {:?}",
                    seed.position
                );
            }
        }
    }

    #[test]
    fn test_zero_count_disables_driver() {
        let mut field = OscillatorField::new(test_params(0));
        assert!(field.step(1.0 / 60.0).is_empty());
    }

    #[test]
    fn test_set_params_rebuilds_only_on_count_change() {
        let mut field = OscillatorField::new(test_params(3));
        field.step(0.5);
        let displaced = field.oscillators[0].displacement;
        let mut params = test_params(3);
        params.damping += 0.1;
        field.set_params(params);
        assert_eq!(
            field.oscillators[0].displacement, displaced,
            "parameter tweak should not reset state"
        );
        field.set_params(test_params(6));
        assert_eq!(field.oscillators.len(), 6);
        assert_eq!(field.oscillators[0].displacement, [0.0, 0.0]);
    }
}
