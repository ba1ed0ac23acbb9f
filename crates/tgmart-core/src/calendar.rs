use chrono::{Datelike, NaiveDate, Weekday};

use crate::DateDim;

impl DateDim {
    pub fn from_date(date: NaiveDate) -> Self {
        let weekday = date.weekday();
        Self {
            date_pk: date,
            day: date.day() as i32,
            month: date.month() as i32,
            month_name: date.format("%B").to_string(),
            year: date.year(),
            quarter: date.month0() as i32 / 3 + 1,
            day_of_week: weekday.number_from_monday() as i32,
            day_of_year: date.ordinal() as i32,
            iso_week: date.iso_week().week() as i32,
            is_weekend: matches!(weekday, Weekday::Sat | Weekday::Sun),
        }
    }
}
