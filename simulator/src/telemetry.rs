use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// One feed line as written by a trekker's base station.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reading {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub temperature: f64,
    pub pressure: f64,
    pub battery: u8,
    pub rssi: i32,
    pub alert: u8,
}

/// Random-walk state of one simulated trekker.
#[derive(Debug, Clone)]
pub struct Trekker {
    pub id: String,
    latitude: f64,
    longitude: f64,
    altitude: f64,
    battery: f64,
    alert_ticks_left: u32,
}

impl Trekker {
    pub fn new(id: String, latitude: f64, longitude: f64) -> Self {
        Self {
            id,
            latitude,
            longitude,
            altitude: 900.0,
            battery: 100.0,
            alert_ticks_left: 0,
        }
    }

    pub fn step(&mut self, rng: &mut impl Rng, alert_probability: f64) -> Reading {
        self.latitude += rng.gen_range(-0.0002..0.0002);
        self.longitude += rng.gen_range(-0.0002..0.0002);
        self.altitude = (self.altitude + rng.gen_range(-3.0..3.0)).max(0.0);
        self.battery = (self.battery - rng.gen_range(0.0..0.3)).max(0.0);

        // Emergencies last several ticks so the monitor sees an episode
        if self.alert_ticks_left == 0 && rng.gen_bool(alert_probability) {
            self.alert_ticks_left = rng.gen_range(3..8);
        }
        let alert = if self.alert_ticks_left > 0 {
            self.alert_ticks_left -= 1;
            1
        } else if rng.gen_bool(0.02) {
            2
        } else {
            0
        };

        // Occasionally the GPS has no fix
        let (latitude, longitude) = if rng.gen_bool(0.05) {
            (0.0, 0.0)
        } else {
            (self.latitude, self.longitude)
        };

        Reading {
            id: self.id.clone(),
            timestamp: Utc::now(),
            latitude,
            longitude,
            altitude: (self.altitude * 10.0).round() / 10.0,
            temperature: (rng.gen_range(15.0..30.0_f64) * 10.0).round() / 10.0,
            pressure: 1013.25 * (1.0 - self.altitude / 44330.0).powf(5.255),
            battery: self.battery as u8,
            rssi: rng.gen_range(-120..-40),
            alert,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_step_stays_in_valid_ranges() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut trekker = Trekker::new("p1".to_string(), 12.961, 77.598);

        for _ in 0..500 {
            let reading = trekker.step(&mut rng, 0.05);
            assert!(reading.battery <= 100);
            assert!(reading.alert <= 2);
            assert!(reading.pressure > 300.0 && reading.pressure < 1100.0);
            assert!(reading.latitude == 0.0 || (reading.latitude - 12.961).abs() < 0.1);
        }
    }

    #[test]
    fn test_emergency_spans_multiple_ticks() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut trekker = Trekker::new("p2".to_string(), 0.0, 0.0);

        let first = trekker.step(&mut rng, 1.0);
        let second = trekker.step(&mut rng, 1.0);
        assert_eq!(first.alert, 1);
        assert_eq!(second.alert, 1);
    }

    #[test]
    fn test_reading_serializes_as_feed_line() {
        let mut rng = StdRng::seed_from_u64(3);
        let reading = Trekker::new("p3".to_string(), 28.6, 77.2).step(&mut rng, 0.0);
        let line = serde_json::to_string(&reading).unwrap();

        assert!(!line.contains('\n'));
        assert!(line.contains("\"id\":\"p3\""));
    }
}
