//! Synthetic member-period data shared by the unit tests.

use crate::data::{ColumnData, MemberTable};
use crate::sigmoid;
use chrono::{Months, NaiveDate};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

pub(crate) const TARGET: &str = "any_event_next_90d";

/// A labelled design matrix with three informative columns, one of them binary,
/// plus one pure-noise column.
pub(crate) fn labelled_matrix(n: usize, seed: u64) -> (Array2<f64>, Array1<f64>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).unwrap();
    let mut x = Array2::zeros((n, 4));
    let mut y = Array1::zeros(n);
    for i in 0..n {
        let a = normal.sample(&mut rng);
        let b = normal.sample(&mut rng);
        let flag = if rng.gen_bool(0.3) { 1.0 } else { 0.0 };
        let noise = normal.sample(&mut rng);
        x[[i, 0]] = a;
        x[[i, 1]] = b;
        x[[i, 2]] = flag;
        x[[i, 3]] = noise;
        let p = sigmoid(-1.0 + 1.6 * a - 0.9 * b + 1.2 * flag);
        y[i] = if rng.gen_bool(p) { 1.0 } else { 0.0 };
    }
    (x, y)
}

pub(crate) fn feature_names(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("f{i}")).collect()
}

/// A member-period table with `members` members observed for `periods` months
/// each, starting 2024-07-01. Carries numeric, binary, text and outcome columns.
pub(crate) fn member_table(members: usize, periods: usize, seed: u64) -> MemberTable {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).unwrap();
    let start = NaiveDate::from_ymd_opt(2024, 7, 1).unwrap();

    let rows = members * periods;
    let mut ids = Vec::with_capacity(rows);
    let mut dates = Vec::with_capacity(rows);
    let mut age = Vec::with_capacity(rows);
    let mut chronic = Vec::with_capacity(rows);
    let mut recent_er = Vec::with_capacity(rows);
    let mut noise = Vec::with_capacity(rows);
    let mut plan = Vec::with_capacity(rows);
    let mut any_event = Vec::with_capacity(rows);
    let mut ed_event = Vec::with_capacity(rows);

    for m in 0..members {
        let member_age = 30.0 + 40.0 * rng.gen_range(0.0..1.0);
        let member_chronic = rng.gen_range(0..5) as f64;
        for p in 0..periods {
            ids.push(format!("M{m:05}"));
            dates.push(start.checked_add_months(Months::new(p as u32)));
            let er = if rng.gen_bool(0.25) { 1.0 } else { 0.0 };
            age.push(member_age);
            chronic.push(member_chronic);
            recent_er.push(er);
            noise.push(normal.sample(&mut rng));
            plan.push(Some(if m % 2 == 0 { "gold" } else { "silver" }.to_string()));
            let margin =
                -2.5 + 0.6 * member_chronic + 1.4 * er + 0.03 * (member_age - 50.0);
            let event = if rng.gen_bool(sigmoid(margin)) { 1.0 } else { 0.0 };
            any_event.push(event);
            ed_event.push(if event > 0.0 && rng.gen_bool(0.6) { 1.0 } else { 0.0 });
        }
    }

    MemberTable::new(
        ids,
        dates,
        vec![
            ("age".into(), ColumnData::Numeric(Array1::from_vec(age))),
            ("chronic_count".into(), ColumnData::Numeric(Array1::from_vec(chronic))),
            ("recent_er_flag".into(), ColumnData::Numeric(Array1::from_vec(recent_er))),
            ("noise".into(), ColumnData::Numeric(Array1::from_vec(noise))),
            ("plan".into(), ColumnData::Text(plan)),
            (TARGET.into(), ColumnData::Numeric(Array1::from_vec(any_event))),
            ("ed_event_next_30d".into(), ColumnData::Numeric(Array1::from_vec(ed_event))),
        ],
    )
    .unwrap()
}
