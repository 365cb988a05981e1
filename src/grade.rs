use chrono::{Datelike, NaiveDate};

/// Japanese school grade label for a birth date as of `today`.
///
/// The school year starts in April, so children born January to March join
/// the cohort of the previous calendar year. Only middle school and high
/// school are labelled; any other age yields an empty string.
pub fn school_grade(birth: NaiveDate, today: NaiveDate) -> &'static str {
    let cohort_year = if birth.month() < 4 {
        birth.year() - 1
    } else {
        birth.year()
    };
    match today.year() - cohort_year {
        13 => "中学 1年",
        14 => "中学 2年",
        15 => "中学 3年",
        16 => "高校 1年",
        17 => "高校 2年",
        18 => "高校 3年",
        _ => "",
    }
}

pub fn format_birth_day(birth: NaiveDate) -> String {
    format!("{}年 {}月 {}日", birth.year(), birth.month(), birth.day())
}
