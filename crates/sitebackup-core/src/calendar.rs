//! HTML year calendars showing on which days a target holds archives.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::{Datelike, NaiveDate};

use crate::target::StoredArchiveRef;

const MONTHS: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

const WEEKDAYS: [(&str, &str); 7] = [
    ("mon", "Mon"),
    ("tue", "Tue"),
    ("wed", "Wed"),
    ("thu", "Thu"),
    ("fri", "Fri"),
    ("sat", "Sat"),
    ("sun", "Sun"),
];

const STYLE: &str = r#"
body { font-family: Arial, Helvetica, sans-serif; color: #2c3e50; background-color: #ecf0f1; }
table, td, th { vertical-align: top; }
table.year { border-spacing: 0; border-collapse: separate; }
table.year td { padding: 1vw; }
table.month { border-spacing: 0.6vw; border-collapse: separate; }
table.month td { width: 2.5em; height: 2.5em; padding: 0; vertical-align: middle; text-align: center; }
th.year { font-size: 2em; font-weight: bold; line-height: 2em; color: #3498db; }
th.month { font-size: 1.2em; font-weight: bold; line-height: 2em; }
th.mon, th.tue, th.wed, th.thu, th.fri, th.sat, th.sun { color: #bdc3c7; font-weight: normal; }
.today { border-radius: 50%; box-shadow: 0 0 0 3px #2ecc71; }
.future { color: #bdc3c7; }
.hasarchive { font-weight: bold; color: #ecf0f1; background-color: #16a085; border-radius: 50%; }
"#;

/// Archive counts per day, rendered as one calendar table per year.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Calendar {
    dates: BTreeMap<NaiveDate, usize>,
    today: NaiveDate,
}

impl Calendar {
    pub fn new(archives: &[StoredArchiveRef], today: NaiveDate) -> Self {
        let mut dates = BTreeMap::new();
        for archive in archives {
            *dates.entry(archive.created.date_naive()).or_insert(0) += 1;
        }
        Self { dates, today }
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    /// Number of archives created on `day`.
    pub fn count(&self, day: NaiveDate) -> usize {
        self.dates.get(&day).copied().unwrap_or(0)
    }

    /// Years holding at least one archive, oldest first.
    pub fn years(&self) -> Vec<i32> {
        let mut years: Vec<i32> = self.dates.keys().map(|d| d.year()).collect();
        years.dedup();
        years
    }

    /// A standalone HTML page. Years without archives are left out.
    pub fn to_html(&self) -> String {
        let mut html = String::new();
        html.push_str("<!DOCTYPE HTML>\n<html>\n<head>\n<meta charset=\"utf-8\">\n");
        html.push_str("<title>Calendar</title>\n");
        let _ = writeln!(html, "<style type=\"text/css\">{STYLE}</style>");
        html.push_str("</head>\n<body>\n");
        for year in self.years() {
            self.write_year(&mut html, year);
        }
        html.push_str("</body>\n</html>\n");
        html
    }

    fn write_year(&self, html: &mut String, year: i32) {
        html.push_str("<table border=\"0\" cellpadding=\"0\" cellspacing=\"0\" class=\"year\">\n");
        let _ = writeln!(html, "<tr><th colspan=\"3\" class=\"year\">{year}</th></tr>");
        for quarter in 0..4u32 {
            html.push_str("<tr>");
            for month in 1..=3u32 {
                html.push_str("<td>\n");
                self.write_month(html, year, quarter * 3 + month);
                html.push_str("</td>");
            }
            html.push_str("</tr>\n");
        }
        html.push_str("</table>\n");
    }

    fn write_month(&self, html: &mut String, year: i32, month: u32) {
        let Some(first) = NaiveDate::from_ymd_opt(year, month, 1) else {
            return;
        };

        // Monday-first weeks, padded with empty cells on both ends.
        let mut cells: Vec<Option<NaiveDate>> =
            vec![None; first.weekday().num_days_from_monday() as usize];
        cells.extend(
            first
                .iter_days()
                .take_while(|d| d.month() == month)
                .map(Some),
        );
        while cells.len() % 7 != 0 {
            cells.push(None);
        }

        html.push_str("<table border=\"0\" cellpadding=\"0\" cellspacing=\"0\" class=\"month\">\n");
        let _ = writeln!(
            html,
            "<tr><th colspan=\"7\" class=\"month\">{}</th></tr>",
            MONTHS[(month - 1) as usize]
        );
        html.push_str("<tr>");
        for (class, label) in WEEKDAYS {
            let _ = write!(html, "<th class=\"{class}\">{label}</th>");
        }
        html.push_str("</tr>\n");

        for week in cells.chunks(7) {
            html.push_str("<tr>");
            for (weekday, cell) in week.iter().enumerate() {
                match cell {
                    Some(day) => self.write_day(html, *day, WEEKDAYS[weekday].0),
                    None => html.push_str("<td class=\"noday\">&nbsp;</td>"),
                }
            }
            html.push_str("</tr>\n");
        }
        html.push_str("</table>\n");
    }

    fn write_day(&self, html: &mut String, day: NaiveDate, weekday: &str) {
        let mut class = weekday.to_string();
        if day == self.today {
            class.push_str(" today");
        } else if day > self.today {
            class.push_str(" future");
        }
        match self.count(day) {
            0 => {
                let _ = write!(html, "<td class=\"{class}\">{}</td>", day.day());
            }
            count => {
                let plural = if count == 1 { "" } else { "s" };
                let _ = write!(
                    html,
                    "<td class=\"{class} hasarchive\" title=\"{count} archive{plural}\">{}</td>",
                    day.day()
                );
            }
        }
    }
}
